use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{Grant, Privilege};
use crate::principal::Principal;
use crate::Result;

/// Where a request sits in its lifecycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// A request for (optionally time-bounded) access to a securable
///
/// Requests are first class so that approval produces exactly the
/// grant the reconciler will manage, and expiry is a state transition
/// rather than a side channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AccessRequest {
    pub id: Uuid,

    pub requester: Principal,

    /// Fully qualified name of the securable
    pub resource: String,

    pub requested_privileges: BTreeSet<Privilege>,

    pub justification: String,

    /// When set, approval yields a time-bounded grant of this length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_duration_secs: Option<u64>,

    pub status: RequestStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<Principal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,

    pub submitted_at: DateTime<Utc>,
}

impl AccessRequest {
    /// Submit a new request, starting out pending
    pub fn submit(
        requester: Principal,
        resource: &str,
        privileges: &[Privilege],
        justification: &str,
        duration: Option<Duration>,
    ) -> AccessRequest {
        AccessRequest {
            id: Uuid::new_v4(),
            requester,
            resource: resource.into(),
            requested_privileges: privileges.iter().cloned().collect(),
            justification: justification.into(),
            requested_duration_secs: duration.map(|d| d.num_seconds().max(0) as u64),
            status: RequestStatus::Pending,
            reviewer: None,
            reviewed_at: None,
            expires_at: None,
            denial_reason: None,
            submitted_at: Utc::now(),
        }
    }

    /// Approve a pending request and produce the grant to reconcile
    ///
    /// A requested duration turns into `expires_at` on both the
    /// request and the grant.
    pub fn approve(&mut self, reviewer: Principal) -> Result<Grant> {
        ensure!(
            self.status == RequestStatus::Pending,
            "Request {} for {} is not pending",
            self.id,
            self.resource
        );
        let now = Utc::now();
        self.status = RequestStatus::Approved;
        self.reviewer = Some(reviewer);
        self.reviewed_at = Some(now);
        if let Some(secs) = self.requested_duration_secs {
            self.expires_at = Some(now + Duration::seconds(secs as i64));
        }
        let privileges: Vec<Privilege> = self.requested_privileges.iter().cloned().collect();
        let grant = match self.expires_at {
            Some(deadline) => Grant::time_bound(self.requester.clone(), &privileges, deadline),
            None => Grant::new(self.requester.clone(), &privileges),
        };
        Ok(grant)
    }

    pub fn deny(&mut self, reviewer: Principal, reason: &str) -> Result<()> {
        ensure!(
            self.status == RequestStatus::Pending,
            "Request {} for {} is not pending",
            self.id,
            self.resource
        );
        self.status = RequestStatus::Denied;
        self.reviewer = Some(reviewer);
        self.reviewed_at = Some(Utc::now());
        self.denial_reason = Some(reason.into());
        Ok(())
    }

    /// Whether an approved request has passed its deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Approved
            && self.expires_at.map(|t| now >= t).unwrap_or(false)
    }

    /// Transition every approved-and-overdue request to expired
    ///
    /// Returns the resources whose grants the reconciler must revoke.
    pub fn revoke_expired(requests: &mut [AccessRequest], now: DateTime<Utc>) -> Vec<String> {
        let mut touched = Vec::new();
        for req in requests.iter_mut() {
            if req.is_expired(now) {
                debug!("Access request {} on {} expired", req.id, req.resource);
                req.status = RequestStatus::Expired;
                touched.push(req.resource.clone());
            }
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessRequest, RequestStatus};
    use crate::access::Privilege;
    use crate::principal::Principal;
    use chrono::{Duration, Utc};

    fn pending() -> AccessRequest {
        AccessRequest::submit(
            Principal::user("bob@example.com"),
            "analytics_dev.customers",
            &[Privilege::Select],
            "quarterly report",
            Some(Duration::hours(4)),
        )
    }

    #[test]
    fn approve_produces_time_bound_grant() {
        let mut req = pending();
        let grant = req.approve(Principal::user("carol@example.com")).unwrap();
        assert_eq!(req.status, RequestStatus::Approved);
        assert!(req.expires_at.is_some());
        assert_eq!(grant.expires_at, req.expires_at);
        assert!(grant.privileges.contains(&Privilege::Select));
    }

    #[test]
    fn deny_records_reason() {
        let mut req = pending();
        req.deny(Principal::user("carol@example.com"), "no justification")
            .unwrap();
        assert_eq!(req.status, RequestStatus::Denied);
        assert_eq!(req.denial_reason.as_deref(), Some("no justification"));
        // double review is rejected
        assert!(req.approve(Principal::user("carol@example.com")).is_err());
    }

    #[test]
    fn revoke_expired_transitions() {
        let mut req = pending();
        req.approve(Principal::user("carol@example.com")).unwrap();
        // not expired yet
        let touched = AccessRequest::revoke_expired(std::slice::from_mut(&mut req), Utc::now());
        assert!(touched.is_empty());
        // jump past the deadline
        let later = Utc::now() + Duration::hours(5);
        let touched = AccessRequest::revoke_expired(std::slice::from_mut(&mut req), later);
        assert_eq!(touched, vec!["analytics_dev.customers".to_string()]);
        assert_eq!(req.status, RequestStatus::Expired);
    }
}
