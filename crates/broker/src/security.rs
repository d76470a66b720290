use subtle::ConstantTimeEq;

/// The only mechanism the broker speaks on its wire port.
pub const MECHANISM_PLAIN: &str = "PLAIN";

/// Split a SASL PLAIN initial response, `authzid \0 authcid \0 password`.
/// Returns the authcid and password; anything without two NUL separators is
/// malformed.
pub fn parse_plain(auth_bytes: &[u8]) -> Option<(String, String)> {
    let mut parts = auth_bytes.splitn(3, |byte| *byte == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    Some((
        String::from_utf8_lossy(authcid).into_owned(),
        String::from_utf8_lossy(password).into_owned(),
    ))
}

/// Constant-time comparison of the presented password against the configured
/// token.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_with_empty_authzid() {
        let (user, password) = parse_plain(b"\0alice\0s3cret").expect("parse");
        assert_eq!(user, "alice");
        assert_eq!(password, "s3cret");
    }

    #[test]
    fn plain_with_authzid() {
        let (user, password) = parse_plain(b"admin\0alice\0pw").expect("parse");
        assert_eq!(user, "alice");
        assert_eq!(password, "pw");
    }

    #[test]
    fn malformed_plain_is_rejected() {
        assert!(parse_plain(b"").is_none());
        assert!(parse_plain(b"no-separators").is_none());
        assert!(parse_plain(b"\0only-one").is_none());
    }

    #[test]
    fn token_comparison() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "Secret"));
        assert!(!token_matches("secret", "secret2"));
        assert!(!token_matches("secret", ""));
    }
}
