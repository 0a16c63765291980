// Upgrade-path routing for producer and consumer connections.
// The parse is pure and synchronous; it never touches the broker.
use std::fmt;
use wsgate_bridge::TopicAddress;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("path must start with /ws")]
    MissingPrefix,
    #[error("unknown role: {0:?}")]
    UnknownRole(String),
    #[error("unsupported persistence: {0:?}")]
    UnsupportedPersistence(String),
    #[error("missing path segment: {0}")]
    MissingSegment(&'static str),
    #[error("consumer routes require a subscription segment")]
    MissingSubscription,
    #[error("unexpected trailing segments")]
    TrailingSegments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub role: Role,
    pub address: TopicAddress,
    pub subscription: Option<String>,
}

/// Parse an upgrade request path of the form
/// `/ws/{role}/persistent/{tenant}/{namespace}/{topic}[/{subscription}]`.
///
/// A trailing slash is tolerated (some clients append one) and any query
/// string is ignored. Consumer routes must carry a subscription segment;
/// producer routes must not.
pub fn parse_path(path: &str) -> Result<TopicRoute, RouteError> {
    let path = path.split('?').next().unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);

    let mut segments = path.split('/');
    // A leading slash yields one empty segment before "ws".
    if segments.next() != Some("") {
        return Err(RouteError::MissingPrefix);
    }
    if segments.next() != Some("ws") {
        return Err(RouteError::MissingPrefix);
    }

    let role = match segments.next() {
        Some("producer") => Role::Producer,
        Some("consumer") => Role::Consumer,
        Some(other) => return Err(RouteError::UnknownRole(other.to_string())),
        None => return Err(RouteError::MissingSegment("role")),
    };
    match segments.next() {
        Some("persistent") => {}
        Some(other) => return Err(RouteError::UnsupportedPersistence(other.to_string())),
        None => return Err(RouteError::MissingSegment("persistence")),
    }

    let tenant = required(segments.next(), "tenant")?;
    let namespace = required(segments.next(), "namespace")?;
    let topic = required(segments.next(), "topic")?;

    let subscription = match role {
        Role::Producer => None,
        Role::Consumer => match segments.next() {
            Some(value) if !value.is_empty() => Some(value.to_string()),
            _ => return Err(RouteError::MissingSubscription),
        },
    };
    if segments.next().is_some() {
        return Err(RouteError::TrailingSegments);
    }

    Ok(TopicRoute {
        role,
        address: TopicAddress::new(tenant, namespace, topic),
        subscription,
    })
}

fn required(segment: Option<&str>, name: &'static str) -> Result<String, RouteError> {
    match segment {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(RouteError::MissingSegment(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_producer_route() {
        let route = parse_path("/ws/producer/persistent/t1/ns1/topic1").expect("route");
        assert_eq!(route.role, Role::Producer);
        assert_eq!(route.address, TopicAddress::new("t1", "ns1", "topic1"));
        assert_eq!(route.subscription, None);
    }

    #[test]
    fn parses_consumer_route_with_subscription() {
        let route = parse_path("/ws/consumer/persistent/t1/ns1/topic1/sub1").expect("route");
        assert_eq!(route.role, Role::Consumer);
        assert_eq!(route.address, TopicAddress::new("t1", "ns1", "topic1"));
        assert_eq!(route.subscription.as_deref(), Some("sub1"));
    }

    #[test]
    fn tolerates_trailing_slash() {
        // Some producer clients append a trailing slash to the topic path.
        let route = parse_path("/ws/producer/persistent/t1/ns1/topic1/").expect("route");
        assert_eq!(route.role, Role::Producer);
        assert_eq!(route.address.topic, "topic1");
    }

    #[test]
    fn ignores_query_string() {
        let route = parse_path("/ws/producer/persistent/t1/ns1/topic1?token=abc").expect("route");
        assert_eq!(route.address.topic, "topic1");
    }

    #[test]
    fn consumer_without_subscription_is_rejected() {
        let err = parse_path("/ws/consumer/persistent/t1/ns1/topic1").expect_err("missing sub");
        assert_eq!(err, RouteError::MissingSubscription);
    }

    #[test]
    fn producer_with_extra_segment_is_rejected() {
        let err = parse_path("/ws/producer/persistent/t1/ns1/topic1/extra").expect_err("extra");
        assert_eq!(err, RouteError::TrailingSegments);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = parse_path("/ws/reader/persistent/t1/ns1/topic1").expect_err("role");
        assert_eq!(err, RouteError::UnknownRole("reader".to_string()));
    }

    #[test]
    fn non_persistent_topics_are_rejected() {
        let err = parse_path("/ws/producer/ephemeral/t1/ns1/topic1").expect_err("persistence");
        assert_eq!(
            err,
            RouteError::UnsupportedPersistence("ephemeral".to_string())
        );
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        assert_eq!(
            parse_path("/api/producer/persistent/t1/ns1/topic1"),
            Err(RouteError::MissingPrefix)
        );
        assert_eq!(parse_path("ws/producer"), Err(RouteError::MissingPrefix));
        assert_eq!(parse_path(""), Err(RouteError::MissingPrefix));
    }

    #[test]
    fn empty_segments_are_rejected() {
        let err = parse_path("/ws/producer/persistent//ns1/topic1").expect_err("tenant");
        assert_eq!(err, RouteError::MissingSegment("tenant"));

        let err = parse_path("/ws/producer/persistent/t1/ns1").expect_err("topic");
        assert_eq!(err, RouteError::MissingSegment("topic"));
    }
}
