use serde::{Deserialize, Serialize};

use crate::{Capability, EngineError, EngineResult, UserId, UserRole, VenueId, VenueRole};

/// The acting user as seen by the guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role: UserRole,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "role")]
pub enum EffectiveRole {
    SuperAdmin,
    Venue(VenueRole),
}

impl EffectiveRole {
    #[must_use]
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::SuperAdmin => &[
                Capability::Read,
                Capability::Write,
                Capability::ManageGoals,
                Capability::ManageVenue,
                Capability::Administer,
            ],
            Self::Venue(VenueRole::VenueAdmin) => &[
                Capability::Read,
                Capability::Write,
                Capability::ManageGoals,
                Capability::ManageVenue,
            ],
            Self::Venue(VenueRole::Staff) => &[Capability::Read, Capability::Write],
        }
    }

    #[must_use]
    pub fn grants(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Global `super_admin` wins; otherwise only the venue membership counts.
/// A global `venue_admin`/`staff` role carries no venue authority on its own.
#[must_use]
pub fn resolve_effective_role(
    principal: &Principal,
    membership: Option<VenueRole>,
) -> Option<EffectiveRole> {
    if !principal.is_active {
        return None;
    }

    if principal.role == UserRole::SuperAdmin {
        return Some(EffectiveRole::SuperAdmin);
    }

    membership.map(EffectiveRole::Venue)
}

/// Decides whether `principal` may exercise `required` on `venue_id`.
///
/// Pass `venue_id: None` for catalog- or user-level operations; those are
/// only reachable through the global bypass.
///
/// # Errors
/// Returns [`EngineError::Forbidden`] for deactivated users, users without a
/// membership on the venue, and roles lacking the capability.
pub fn authorize(
    principal: &Principal,
    venue_id: Option<VenueId>,
    membership: Option<VenueRole>,
    required: Capability,
) -> EngineResult<EffectiveRole> {
    if !principal.is_active {
        return Err(EngineError::Forbidden(format!(
            "user {} is deactivated",
            principal.user_id
        )));
    }

    let scoped_membership = if venue_id.is_some() { membership } else { None };
    let Some(role) = resolve_effective_role(principal, scoped_membership) else {
        return Err(EngineError::Forbidden(match venue_id {
            Some(venue_id) => format!(
                "user {} has no role on venue {venue_id}",
                principal.user_id
            ),
            None => format!(
                "user {} lacks global {} capability",
                principal.user_id,
                required.as_str()
            ),
        }));
    };

    if !role.grants(required) {
        return Err(EngineError::Forbidden(format!(
            "user {} lacks {} capability",
            principal.user_id,
            required.as_str()
        )));
    }

    Ok(role)
}
