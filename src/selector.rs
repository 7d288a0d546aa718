//! Server selection between the primary and the additional profile

use crate::errors::{RelayError, Result};
use crate::profile::{ServerKey, ServerProfile};
use crate::settings::Settings;
use tracing::debug;

/// Outcome of a selection: the profile to use and which key it answers to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedServer {
    pub requested: ServerKey,
    pub key: ServerKey,
    pub profile: ServerProfile,
}

impl ResolvedServer {
    pub fn base_url(&self) -> &str {
        &self.profile.base_url
    }

    pub fn credential(&self) -> &str {
        &self.profile.credential
    }

    pub fn api_endpoint(&self) -> String {
        self.profile.api_endpoint()
    }

    /// The additional server was asked for but primary answered
    pub fn fell_back(&self) -> bool {
        self.requested != self.key
    }
}

/// Profiles a user may pick from right now, primary first.
///
/// The additional profile is listed only when the feature flag is on and it
/// is complete.
pub fn selectable_profiles(settings: &Settings) -> Vec<ServerProfile> {
    let mut profiles = vec![settings.primary_profile()];

    let additional = settings.additional_profile();
    if settings.enable_additional_server && additional.is_complete() {
        profiles.push(additional);
    }

    profiles
}

/// Resolve `choice` against a settings snapshot.
///
/// An unusable additional profile falls back to primary; only an incomplete
/// primary is reported as an error.
pub fn resolve(settings: &Settings, choice: ServerKey) -> Result<ResolvedServer> {
    if choice == ServerKey::Additional {
        let additional = settings.additional_profile();
        if settings.enable_additional_server && additional.is_complete() {
            return Ok(ResolvedServer {
                requested: choice,
                key: ServerKey::Additional,
                profile: additional,
            });
        }

        debug!(
            "Additional server unavailable (enabled: {}), falling back to primary",
            settings.enable_additional_server
        );
    }

    let primary = settings.primary_profile();
    if primary.base_url.is_empty() {
        return Err(RelayError::Configuration(
            "server URL is not configured".to_string(),
        ));
    }
    if primary.credential.is_empty() {
        return Err(RelayError::Configuration(
            "API signature is not configured".to_string(),
        ));
    }

    Ok(ResolvedServer {
        requested: choice,
        key: ServerKey::Primary,
        profile: primary,
    })
}
