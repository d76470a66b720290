#![forbid(unsafe_code)]

//! Static registry of the APIs this broker speaks: key numbers, supported
//! version ranges, flexible-version thresholds, and wire error codes.

pub const ERROR_NONE: i16 = 0;
pub const ERROR_OFFSET_OUT_OF_RANGE: i16 = 1;
pub const ERROR_UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
pub const ERROR_INVALID_MESSAGE: i16 = 4;
pub const ERROR_LEADER_NOT_AVAILABLE: i16 = 5;
pub const ERROR_MESSAGE_TOO_LARGE: i16 = 10;
pub const ERROR_COORDINATOR_NOT_AVAILABLE: i16 = 15;
pub const ERROR_NOT_COORDINATOR: i16 = 16;
pub const ERROR_INVALID_TOPIC: i16 = 17;
pub const ERROR_ILLEGAL_GENERATION: i16 = 22;
pub const ERROR_INCONSISTENT_GROUP_PROTOCOL: i16 = 23;
pub const ERROR_UNKNOWN_MEMBER_ID: i16 = 25;
pub const ERROR_INVALID_SESSION_TIMEOUT: i16 = 26;
pub const ERROR_REBALANCE_IN_PROGRESS: i16 = 27;
pub const ERROR_SASL_AUTHENTICATION_FAILED: i16 = 31;
pub const ERROR_UNSUPPORTED_SASL_MECHANISM: i16 = 33;
pub const ERROR_UNSUPPORTED_VERSION: i16 = 35;
pub const ERROR_TOPIC_ALREADY_EXISTS: i16 = 36;

/// Compression codecs carried in record-batch attribute bits 0-2.
pub const CODEC_NONE: i8 = 0;
pub const CODEC_GZIP: i8 = 1;
pub const CODEC_SNAPPY: i8 = 2;
pub const CODEC_LZ4: i8 = 3;
pub const CODEC_ZSTD: i8 = 4;

/// Timestamp sentinels in ListOffsets requests.
pub const OFFSET_LATEST: i64 = -1;
pub const OFFSET_EARLIEST: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    OffsetCommit,
    OffsetFetch,
    FindCoordinator,
    JoinGroup,
    Heartbeat,
    LeaveGroup,
    SyncGroup,
    SaslHandshake,
    ApiVersions,
    CreateTopics,
    SaslAuthenticate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionRange {
    pub low: i16,
    pub high: i16,
}

impl VersionRange {
    pub const fn contains(self, version: i16) -> bool {
        self.low <= version && version <= self.high
    }
}

impl ApiKey {
    pub const ALL: [ApiKey; 15] = [
        ApiKey::Produce,
        ApiKey::Fetch,
        ApiKey::ListOffsets,
        ApiKey::Metadata,
        ApiKey::OffsetCommit,
        ApiKey::OffsetFetch,
        ApiKey::FindCoordinator,
        ApiKey::JoinGroup,
        ApiKey::Heartbeat,
        ApiKey::LeaveGroup,
        ApiKey::SyncGroup,
        ApiKey::SaslHandshake,
        ApiKey::ApiVersions,
        ApiKey::CreateTopics,
        ApiKey::SaslAuthenticate,
    ];

    pub const fn code(self) -> i16 {
        match self {
            Self::Produce => 0,
            Self::Fetch => 1,
            Self::ListOffsets => 2,
            Self::Metadata => 3,
            Self::OffsetCommit => 8,
            Self::OffsetFetch => 9,
            Self::FindCoordinator => 10,
            Self::JoinGroup => 11,
            Self::Heartbeat => 12,
            Self::LeaveGroup => 13,
            Self::SyncGroup => 14,
            Self::SaslHandshake => 17,
            Self::ApiVersions => 18,
            Self::CreateTopics => 19,
            Self::SaslAuthenticate => 36,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.iter().copied().find(|api| api.code() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Produce => "Produce",
            Self::Fetch => "Fetch",
            Self::ListOffsets => "ListOffsets",
            Self::Metadata => "Metadata",
            Self::OffsetCommit => "OffsetCommit",
            Self::OffsetFetch => "OffsetFetch",
            Self::FindCoordinator => "FindCoordinator",
            Self::JoinGroup => "JoinGroup",
            Self::Heartbeat => "Heartbeat",
            Self::LeaveGroup => "LeaveGroup",
            Self::SyncGroup => "SyncGroup",
            Self::SaslHandshake => "SaslHandshake",
            Self::ApiVersions => "ApiVersions",
            Self::CreateTopics => "CreateTopics",
            Self::SaslAuthenticate => "SaslAuthenticate",
        }
    }

    /// Versions this broker advertises and serves.
    pub const fn supported_versions(self) -> VersionRange {
        let (low, high) = match self {
            Self::Produce => (0, 8),
            Self::Fetch => (0, 11),
            Self::ListOffsets => (0, 5),
            Self::Metadata => (0, 8),
            Self::OffsetCommit => (0, 8),
            Self::OffsetFetch => (0, 5),
            Self::FindCoordinator => (0, 3),
            Self::JoinGroup => (0, 5),
            Self::Heartbeat => (0, 3),
            Self::LeaveGroup => (0, 3),
            Self::SyncGroup => (0, 3),
            Self::SaslHandshake => (0, 1),
            Self::ApiVersions => (0, 3),
            Self::CreateTopics => (0, 5),
            Self::SaslAuthenticate => (0, 2),
        };
        VersionRange { low, high }
    }

    /// Version at which an API switches to compact encodings and tagged
    /// fields.  APIs that never flex within their supported range return
    /// `i16::MAX`.
    pub const fn first_flexible_version(self) -> i16 {
        match self {
            Self::Produce => 9,
            Self::Fetch => 12,
            Self::ListOffsets => 6,
            Self::Metadata => 9,
            Self::OffsetFetch => 6,
            Self::FindCoordinator => 3,
            Self::JoinGroup => 6,
            Self::Heartbeat => 4,
            Self::LeaveGroup => 4,
            Self::SyncGroup => 4,
            Self::ApiVersions => 3,
            Self::CreateTopics => 5,
            Self::OffsetCommit | Self::SaslHandshake | Self::SaslAuthenticate => i16::MAX,
        }
    }

    pub const fn is_flexible(self, version: i16) -> bool {
        version >= self.first_flexible_version()
    }

    /// Whether a response header carries tagged fields.  ApiVersions is the
    /// well-known exception: a client that does not yet know the broker's
    /// versions parses the header non-flexibly.
    pub const fn response_header_is_flexible(self, version: i16) -> bool {
        match self {
            Self::ApiVersions => false,
            _ => self.is_flexible(version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_kafka_assignment() {
        assert_eq!(ApiKey::Produce.code(), 0);
        assert_eq!(ApiKey::OffsetCommit.code(), 8);
        assert_eq!(ApiKey::SaslHandshake.code(), 17);
        assert_eq!(ApiKey::SaslAuthenticate.code(), 36);
        for api in ApiKey::ALL {
            assert_eq!(ApiKey::from_code(api.code()), Some(api));
        }
        assert_eq!(ApiKey::from_code(99), None);
    }

    #[test]
    fn supported_ranges_cover_the_advertised_surface() {
        assert_eq!(
            ApiKey::Fetch.supported_versions(),
            VersionRange { low: 0, high: 11 }
        );
        assert!(ApiKey::Produce.supported_versions().contains(8));
        assert!(!ApiKey::Produce.supported_versions().contains(9));
        assert!(!ApiKey::JoinGroup.supported_versions().contains(6));
    }

    #[test]
    fn flexible_thresholds() {
        assert!(ApiKey::ApiVersions.is_flexible(3));
        assert!(!ApiKey::ApiVersions.is_flexible(2));
        assert!(ApiKey::FindCoordinator.is_flexible(3));
        assert!(ApiKey::CreateTopics.is_flexible(5));
        // These stay classic across their whole supported range.
        assert!(!ApiKey::Fetch.is_flexible(11));
        assert!(!ApiKey::Metadata.is_flexible(8));
        assert!(!ApiKey::OffsetCommit.is_flexible(8));
        assert!(!ApiKey::SaslAuthenticate.is_flexible(2));
    }

    #[test]
    fn api_versions_response_header_never_flexes() {
        assert!(!ApiKey::ApiVersions.response_header_is_flexible(3));
        assert!(ApiKey::FindCoordinator.response_header_is_flexible(3));
        assert!(!ApiKey::FindCoordinator.response_header_is_flexible(2));
    }
}
