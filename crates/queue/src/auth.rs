use crate::error::QueueError;

/// Who is asking. Built by the transport layer from a verified token.
#[derive(Debug, Clone)]
pub struct Requester {
    pub user_id: String,
    pub is_admin: bool,
}

impl Requester {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), is_admin: false }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), is_admin: true }
    }
}

/// Which jobs a queue view should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueFilter {
    OwnJobs,
    User(String),
    All,
}

impl QueueFilter {
    /// Parse the `user_filter` query parameter: absent → own jobs,
    /// `*` → everything, anything else → that specific user.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => QueueFilter::OwnJobs,
            Some("*") => QueueFilter::All,
            Some(user_id) => QueueFilter::User(user_id.to_string()),
        }
    }

    /// Label reported back in queue views.
    pub fn label(&self, requester: &Requester) -> String {
        match self {
            QueueFilter::OwnJobs => requester.user_id.clone(),
            QueueFilter::User(user_id) => user_id.clone(),
            QueueFilter::All => "*".to_string(),
        }
    }
}

/// Role-based filter authorization.
///
/// Regular users are forced to their own jobs: asking for themselves by id is
/// allowed (and collapses to `OwnJobs`), anything wider is rejected without
/// revealing whether the target exists. Admins may use any filter.
pub fn authorize_filter(
    requester: &Requester,
    requested: QueueFilter,
) -> Result<QueueFilter, QueueError> {
    if requester.is_admin {
        return Ok(requested);
    }
    match requested {
        QueueFilter::OwnJobs => Ok(QueueFilter::OwnJobs),
        QueueFilter::User(user_id) if user_id == requester.user_id => Ok(QueueFilter::OwnJobs),
        QueueFilter::User(_) | QueueFilter::All => Err(QueueError::Forbidden(
            "user filter outside requester scope".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_query_values() {
        assert_eq!(QueueFilter::parse(None), QueueFilter::OwnJobs);
        assert_eq!(QueueFilter::parse(Some("")), QueueFilter::OwnJobs);
        assert_eq!(QueueFilter::parse(Some("*")), QueueFilter::All);
        assert_eq!(
            QueueFilter::parse(Some("bob")),
            QueueFilter::User("bob".to_string())
        );
    }

    #[test]
    fn regular_user_is_forced_to_self() {
        let alice = Requester::user("alice");
        assert_eq!(
            authorize_filter(&alice, QueueFilter::OwnJobs).unwrap(),
            QueueFilter::OwnJobs
        );
        // Naming yourself explicitly is fine.
        assert_eq!(
            authorize_filter(&alice, QueueFilter::User("alice".to_string())).unwrap(),
            QueueFilter::OwnJobs
        );
        assert!(matches!(
            authorize_filter(&alice, QueueFilter::All),
            Err(QueueError::Forbidden(_))
        ));
        assert!(matches!(
            authorize_filter(&alice, QueueFilter::User("bob".to_string())),
            Err(QueueError::Forbidden(_))
        ));
    }

    #[test]
    fn admin_may_use_any_filter() {
        let root = Requester::admin("root");
        assert_eq!(authorize_filter(&root, QueueFilter::All).unwrap(), QueueFilter::All);
        assert_eq!(
            authorize_filter(&root, QueueFilter::User("bob".to_string())).unwrap(),
            QueueFilter::User("bob".to_string())
        );
    }

    #[test]
    fn filter_labels() {
        let alice = Requester::user("alice");
        assert_eq!(QueueFilter::OwnJobs.label(&alice), "alice");
        assert_eq!(QueueFilter::All.label(&alice), "*");
        assert_eq!(QueueFilter::User("bob".to_string()).label(&alice), "bob");
    }
}
