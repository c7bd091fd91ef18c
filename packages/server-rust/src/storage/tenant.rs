//! Account and region identifier validation.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Account ids are exactly twelve decimal digits.
static ACCOUNT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{12}$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Grammar accepted for region names in permissive mode.
static PERMISSIVE_REGION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Regions recognized without permissive mode.
pub const KNOWN_REGIONS: &[&str] = &[
    "af-south-1",
    "ap-east-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ca-central-1",
    "ca-west-1",
    "cn-north-1",
    "cn-northwest-1",
    "eu-central-1",
    "eu-central-2",
    "eu-north-1",
    "eu-south-1",
    "eu-south-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "il-central-1",
    "me-central-1",
    "me-south-1",
    "mx-central-1",
    "sa-east-1",
    "us-east-1",
    "us-east-2",
    "us-gov-east-1",
    "us-gov-west-1",
    "us-west-1",
    "us-west-2",
];

/// Which half of the tenant key was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Account,
    Region,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account => f.write_str("account id"),
            Self::Region => f.write_str("region"),
        }
    }
}

/// Rejection of a tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier { kind: IdentifierKind, value: String },
}

impl StoreError {
    /// The rejected identifier kind.
    #[must_use]
    pub fn kind(&self) -> IdentifierKind {
        match self {
            Self::InvalidIdentifier { kind, .. } => *kind,
        }
    }
}

/// Checks `(account, region)` pairs before any tenant state is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantValidator {
    /// Accept any well-formed region name, not only the known list.
    pub permissive_regions: bool,
}

impl TenantValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(permissive_regions: bool) -> Self {
        Self { permissive_regions }
    }

    /// Whether `account_id` is a valid account identifier.
    #[must_use]
    pub fn is_account_id(candidate: &str) -> bool {
        ACCOUNT_ID.is_match(candidate)
    }

    /// Whether `region` is a known region name.
    #[must_use]
    pub fn is_known_region(candidate: &str) -> bool {
        KNOWN_REGIONS.binary_search(&candidate).is_ok()
    }

    /// Validates a tenant key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidIdentifier`] naming the first offending part.
    pub fn validate(&self, account_id: &str, region: &str) -> Result<(), StoreError> {
        if !Self::is_account_id(account_id) {
            return Err(StoreError::InvalidIdentifier {
                kind: IdentifierKind::Account,
                value: account_id.to_string(),
            });
        }
        let region_ok = if self.permissive_regions {
            region.len() <= 32 && PERMISSIVE_REGION.is_match(region)
        } else {
            Self::is_known_region(region)
        };
        if !region_ok {
            return Err(StoreError::InvalidIdentifier {
                kind: IdentifierKind::Region,
                value: region.to_string(),
            });
        }
        Ok(())
    }
}
