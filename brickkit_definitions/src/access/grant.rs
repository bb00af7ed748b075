use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::Privilege;
use crate::principal::Principal;
use crate::resources::ResourceType;
use crate::Result;

/// A set of privileges for one principal on one securable
///
/// ```yaml
/// principal:
///   type: group
///   name: analysts
/// privileges: [USE_SCHEMA, SELECT]
/// ```
///
/// A grant carrying `expires_at` is a time-bounded grant: the
/// reconciler treats it as declared while the deadline is in the
/// future and revokes it afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Grant {
    pub principal: Principal,

    pub privileges: BTreeSet<Privilege>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<DateTime<Utc>>,

    /// Revocation deadline for time-bounded access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    pub fn new(principal: Principal, privileges: &[Privilege]) -> Grant {
        Grant {
            principal,
            privileges: privileges.iter().cloned().collect(),
            granted_at: None,
            expires_at: None,
        }
    }

    /// A grant that the reconciler revokes once `expires_at` passes
    pub fn time_bound(
        principal: Principal,
        privileges: &[Privilege],
        expires_at: DateTime<Utc>,
    ) -> Grant {
        Grant {
            principal,
            privileges: privileges.iter().cloned().collect(),
            granted_at: Some(Utc::now()),
            expires_at: Some(expires_at),
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Reject privileges that are invalid for the resource type
    pub fn verify(&self, rt: ResourceType) -> Result<()> {
        ensure!(!self.privileges.is_empty(), "Grant without privileges");
        for p in &self.privileges {
            if !p.valid_on(rt) {
                bail!(
                    "Privilege {} is not valid on a {} (principal {})",
                    p,
                    rt,
                    self.principal.name
                );
            }
        }
        Ok(())
    }

    /// Dedup identity pairs: `(resolved principal, privilege)`
    pub fn pairs(&self) -> Vec<(String, Privilege)> {
        let who = self.principal.resolved();
        self.privileges.iter().map(|p| (who.clone(), *p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Grant;
    use crate::access::Privilege;
    use crate::principal::Principal;
    use crate::resources::ResourceType;
    use chrono::{Duration, Utc};

    #[test]
    fn grant_verify_checks_validity() {
        let ok = Grant::new(Principal::group("analysts"), &[Privilege::Select]);
        assert!(ok.verify(ResourceType::Table).is_ok());

        let bad = Grant::new(Principal::group("analysts"), &[Privilege::ReadVolume]);
        assert!(bad.verify(ResourceType::Table).is_err());

        let empty = Grant::new(Principal::group("analysts"), &[]);
        assert!(empty.verify(ResourceType::Table).is_err());
    }

    #[test]
    fn time_bound_grant_expires() {
        let g = Grant::time_bound(
            Principal::user("bob@example.com"),
            &[Privilege::Select],
            Utc::now() - Duration::hours(1),
        );
        assert!(g.expired(Utc::now()));

        let g2 = Grant::time_bound(
            Principal::user("bob@example.com"),
            &[Privilege::Select],
            Utc::now() + Duration::hours(1),
        );
        assert!(!g2.expired(Utc::now()));
        // plain grants never expire
        let g3 = Grant::new(Principal::user("bob@example.com"), &[Privilege::Select]);
        assert!(!g3.expired(Utc::now()));
    }
}
