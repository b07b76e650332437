use crate::config::{FilterConfig, PollingConfig};
use crate::traits::SearchCriteria;
use chrono::{DateTime, Duration, Utc};

/// Builds the search criteria for every poll cycle from the startup settings.
#[derive(Debug, Clone)]
pub struct CriteriaBuilder {
    senders: Vec<String>,
    subject: String,
    deploy_time: DateTime<Utc>,
    forward_historical: bool,
}

impl CriteriaBuilder {
    pub fn new(filter: &FilterConfig, polling: &PollingConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            senders: filter.senders.clone(),
            subject: filter.subject.clone(),
            deploy_time: deploy_time(started_at, polling.deploy_time_offset_minutes),
            forward_historical: polling.forward_historical,
        }
    }

    pub fn deploy_time(&self) -> DateTime<Utc> {
        self.deploy_time
    }

    /// Fresh criteria for one cycle. The time bound is dropped entirely when
    /// historical mail should be forwarded as well.
    pub fn build(&self) -> SearchCriteria {
        SearchCriteria {
            unseen_only: true,
            since: (!self.forward_historical).then_some(self.deploy_time),
            senders: self.senders.clone(),
            subject: self.subject.clone(),
        }
    }
}

/// Process start shifted by the configured number of minutes.
pub fn deploy_time(started_at: DateTime<Utc>, offset_minutes: i64) -> DateTime<Utc> {
    started_at + Duration::minutes(offset_minutes)
}

impl SearchCriteria {
    /// Renders the criteria as an IMAP SEARCH query (RFC 3501 section 6.4.4).
    ///
    /// `SINCE` compares dates only, in whatever timezone the server stamps
    /// its internal dates with. The bound is therefore widened by one day and
    /// the exact instant is checked again after fetching.
    pub fn to_imap_query(&self) -> String {
        let mut keys = Vec::new();

        if self.unseen_only {
            keys.push("UNSEEN".to_string());
        }
        if let Some(since) = self.since {
            let day = since - Duration::days(1);
            keys.push(format!("SINCE {}", day.format("%d-%b-%Y")));
        }
        if let Some(from) = any_sender(&self.senders) {
            keys.push(from);
        }
        keys.push(format!("SUBJECT {}", quote(&self.subject)));

        keys.join(" ")
    }
}

// IMAP OR takes exactly two keys, so longer lists nest to the right
fn any_sender(senders: &[String]) -> Option<String> {
    match senders {
        [] => None,
        [only] => Some(format!("FROM {}", quote(only))),
        [first, rest @ ..] => {
            any_sender(rest).map(|tail| format!("OR FROM {} {}", quote(first), tail))
        }
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn filter() -> FilterConfig {
        FilterConfig {
            senders: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            subject: "Your code".to_string(),
        }
    }

    fn started_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_since_bound_present_by_default() {
        let builder = CriteriaBuilder::new(&filter(), &PollingConfig::default(), started_at());
        let criteria = builder.build();

        assert!(criteria.unseen_only);
        assert_eq!(criteria.since, Some(started_at()));
        assert_eq!(criteria.senders.len(), 2);
        assert_eq!(criteria.subject, "Your code");
    }

    #[test]
    fn test_forward_historical_drops_since_bound() {
        let polling = PollingConfig {
            forward_historical: true,
            ..PollingConfig::default()
        };
        let criteria = CriteriaBuilder::new(&filter(), &polling, started_at()).build();

        assert_eq!(criteria.since, None);
        // sender and subject filters are always kept
        assert_eq!(criteria.senders.len(), 2);
        assert_eq!(criteria.subject, "Your code");
    }

    #[test]
    fn test_deploy_time_offset() {
        let polling = PollingConfig {
            deploy_time_offset_minutes: -90,
            ..PollingConfig::default()
        };
        let builder = CriteriaBuilder::new(&filter(), &polling, started_at());

        assert_eq!(
            builder.deploy_time(),
            Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_imap_query_with_two_senders() {
        let criteria = CriteriaBuilder::new(&filter(), &PollingConfig::default(), started_at())
            .build();

        assert_eq!(
            criteria.to_imap_query(),
            r#"UNSEEN SINCE 01-Mar-2026 OR FROM "a@example.com" FROM "b@example.com" SUBJECT "Your code""#
        );
    }

    #[test]
    fn test_since_day_covers_servers_behind_utc() {
        // 00:45Z lands on 01-Mar for a server stamping mail in -0500
        let criteria = SearchCriteria {
            unseen_only: true,
            since: Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 30, 0).unwrap()),
            senders: vec!["otp@example.com".to_string()],
            subject: "code".to_string(),
        };

        assert_eq!(
            criteria.to_imap_query(),
            r#"UNSEEN SINCE 01-Mar-2026 FROM "otp@example.com" SUBJECT "code""#
        );
    }

    #[test]
    fn test_imap_query_nests_three_senders() {
        let criteria = SearchCriteria {
            unseen_only: true,
            since: None,
            senders: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            subject: "s".to_string(),
        };

        assert_eq!(
            criteria.to_imap_query(),
            r#"UNSEEN OR FROM "a" OR FROM "b" FROM "c" SUBJECT "s""#
        );
    }

    #[test]
    fn test_imap_query_escapes_quotes() {
        let criteria = SearchCriteria {
            unseen_only: false,
            since: None,
            senders: vec!["x@example.com".to_string()],
            subject: r#"Say "hi" \o/"#.to_string(),
        };

        assert_eq!(
            criteria.to_imap_query(),
            r#"FROM "x@example.com" SUBJECT "Say \"hi\" \\o/""#
        );
    }
}
