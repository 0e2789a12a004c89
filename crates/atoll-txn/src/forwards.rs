//! Forward compatibility.
//!
//! Newer clients can mark transaction metadata with requirements that older
//! clients must honor before touching it: "interact with this entry only if
//! you implement extension X". The metadata is a map keyed by interaction
//! point; each entry lists requirements with a behavior for non-compliant
//! clients.
//!
//! The Cleaner checks the `CleanupEntry` point before processing a request;
//! any unmet requirement aborts that cleanup pass (the Cleaner never
//! retries, so `Fail` and `Retry` behaviors end a pass the same way; a
//! later pass by an upgraded client will succeed).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransactionError};

/// Protocol version this client implements.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Protocol extensions this client implements.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["TI", "MO", "BM", "SD", "RC", "UA", "CO"];

/// Interaction points at which compatibility is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionPoint {
    /// Reading a document that carries staging metadata.
    Gets,
    /// Considering a write-write conflict with another attempt's staging.
    WriteWriteConflict,
    /// Cleaning up an ATR entry and its documents.
    CleanupEntry,
}

impl InteractionPoint {
    /// The wire key the metadata map uses for this point.
    #[must_use]
    pub const fn as_wire_str(&self) -> &'static str {
        match self {
            InteractionPoint::Gets => "g",
            InteractionPoint::WriteWriteConflict => "ww",
            InteractionPoint::CleanupEntry => "cl",
        }
    }
}

/// What a non-compliant client must do about a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    /// Fail the interaction.
    #[serde(rename = "f")]
    Fail,
    /// Back off and retry the interaction later.
    #[serde(rename = "r")]
    Retry,
}

/// One requirement at an interaction point: a minimum protocol version or a
/// named extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardCompatRequirement {
    /// Minimum protocol version required, e.g. `"2.2"`.
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Named extension required, e.g. `"SD"`.
    #[serde(rename = "e", skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Behavior for clients that do not meet the requirement.
    #[serde(rename = "b")]
    pub behavior: Behavior,
}

/// Forward-compatibility metadata: interaction point → requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardCompatibility(
    /// Interaction-point wire key → requirements recorded at that point.
    pub HashMap<String, Vec<ForwardCompatRequirement>>,
);

impl ForwardCompatibility {
    /// Requirements recorded for an interaction point, if any.
    #[must_use]
    pub fn requirements_for(&self, point: InteractionPoint) -> Option<&[ForwardCompatRequirement]> {
        self.0.get(point.as_wire_str()).map(Vec::as_slice)
    }
}

/// Checks this client against the metadata's requirements for one
/// interaction point.
///
/// # Errors
///
/// `ForwardCompatibilityFailure` when a requirement names an extension or
/// protocol version this client does not implement.
pub fn check(point: InteractionPoint, metadata: Option<&ForwardCompatibility>) -> Result<()> {
    let Some(requirements) = metadata.and_then(|m| m.requirements_for(point)) else {
        return Ok(());
    };

    for requirement in requirements {
        if let Some(extension) = &requirement.extension {
            if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
                return Err(TransactionError::ForwardCompatibilityFailure {
                    requirement: format!("extension {extension}"),
                });
            }
        }
        if let Some(version) = &requirement.protocol_version {
            if !version_supported(version) {
                return Err(TransactionError::ForwardCompatibilityFailure {
                    requirement: format!("protocol {version}"),
                });
            }
        }
    }
    Ok(())
}

/// Numeric major.minor comparison; unparseable versions are unsupported.
fn version_supported(required: &str) -> bool {
    match (parse_version(required), parse_version(PROTOCOL_VERSION)) {
        (Some(required), Some(ours)) => required <= ours,
        _ => false,
    }
}

fn parse_version(v: &str) -> Option<(u32, u32)> {
    let (major, minor) = v.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(point: &str, requirement: ForwardCompatRequirement) -> ForwardCompatibility {
        let mut map = HashMap::new();
        map.insert(point.to_string(), vec![requirement]);
        ForwardCompatibility(map)
    }

    #[test]
    fn absent_metadata_passes() {
        assert!(check(InteractionPoint::CleanupEntry, None).is_ok());
        assert!(
            check(
                InteractionPoint::CleanupEntry,
                Some(&ForwardCompatibility::default())
            )
            .is_ok()
        );
    }

    #[test]
    fn supported_extension_passes() {
        let md = metadata(
            "cl",
            ForwardCompatRequirement {
                protocol_version: None,
                extension: Some("SD".into()),
                behavior: Behavior::Fail,
            },
        );
        assert!(check(InteractionPoint::CleanupEntry, Some(&md)).is_ok());
    }

    #[test]
    fn unsupported_extension_fails_regardless_of_behavior() {
        for behavior in [Behavior::Fail, Behavior::Retry] {
            let md = metadata(
                "cl",
                ForwardCompatRequirement {
                    protocol_version: None,
                    extension: Some("XX".into()),
                    behavior,
                },
            );
            let err = check(InteractionPoint::CleanupEntry, Some(&md)).unwrap_err();
            assert!(matches!(
                err,
                TransactionError::ForwardCompatibilityFailure { .. }
            ));
        }
    }

    #[test]
    fn newer_protocol_version_fails() {
        let md = metadata(
            "cl",
            ForwardCompatRequirement {
                protocol_version: Some("3.0".into()),
                extension: None,
                behavior: Behavior::Fail,
            },
        );
        assert!(check(InteractionPoint::CleanupEntry, Some(&md)).is_err());

        let md = metadata(
            "cl",
            ForwardCompatRequirement {
                protocol_version: Some("1.3".into()),
                extension: None,
                behavior: Behavior::Fail,
            },
        );
        assert!(check(InteractionPoint::CleanupEntry, Some(&md)).is_ok());
    }

    #[test]
    fn requirements_only_bind_their_interaction_point() {
        let md = metadata(
            "g",
            ForwardCompatRequirement {
                protocol_version: None,
                extension: Some("XX".into()),
                behavior: Behavior::Fail,
            },
        );
        // Cleanup is unaffected by a gets-scoped requirement.
        assert!(check(InteractionPoint::CleanupEntry, Some(&md)).is_ok());
        assert!(check(InteractionPoint::Gets, Some(&md)).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let md = metadata(
            "cl",
            ForwardCompatRequirement {
                protocol_version: Some("2.2".into()),
                extension: None,
                behavior: Behavior::Retry,
            },
        );
        let json = serde_json::to_string(&md).unwrap();
        assert_eq!(json, r#"{"cl":[{"p":"2.2","b":"r"}]}"#);
        let parsed: ForwardCompatibility = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, md);
    }
}
