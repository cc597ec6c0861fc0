//! Lead scoring heuristic (0 to 100)

use uuid::Uuid;

/// Everything the score looks at, gathered from the lead, its contact and
/// the contact's activities
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct LeadSignals {
    pub source: String,
    pub status: String,
    pub estimated_value_cents: Option<i64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub job_title: Option<String>,
    pub company_id: Option<Uuid>,
    pub activity_count: i64,
}

const DECISION_MAKER_TITLES: [&str; 10] = [
    "ceo",
    "cto",
    "cfo",
    "coo",
    "founder",
    "owner",
    "president",
    "vp",
    "vice president",
    "director",
];

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).is_some_and(|v| !v.is_empty())
}

fn contact_points(signals: &LeadSignals) -> i32 {
    let mut points = 0;
    if present(&signals.email) {
        points += 10;
    }
    if present(&signals.phone) {
        points += 5;
    }
    if signals.company_id.is_some() {
        points += 5;
    }
    points
}

fn title_points(job_title: Option<&str>) -> i32 {
    let Some(title) = job_title.map(str::to_ascii_lowercase) else {
        return 0;
    };
    let words: Vec<&str> = title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let decision_maker = DECISION_MAKER_TITLES.iter().any(|t| {
        if t.contains(' ') {
            title.contains(t)
        } else {
            words.contains(t)
        }
    }) || words.contains(&"head");

    if decision_maker {
        20
    } else if words.contains(&"manager") || words.contains(&"lead") {
        10
    } else {
        0
    }
}

fn source_points(source: &str) -> i32 {
    match source {
        "referral" => 20,
        "website" | "inbound" => 15,
        "event" => 10,
        "social" => 5,
        _ => 0,
    }
}

fn value_points(cents: Option<i64>) -> i32 {
    match cents.unwrap_or(0) {
        v if v >= 5_000_000 => 20,
        v if v >= 1_000_000 => 15,
        v if v >= 100_000 => 10,
        v if v > 0 => 5,
        _ => 0,
    }
}

fn status_points(status: &str) -> i32 {
    match status {
        "converted" => 20,
        "qualified" => 15,
        "contacted" => 5,
        "unqualified" => -30,
        _ => 0,
    }
}

/// Score a lead; higher means more likely to convert
pub fn score(signals: &LeadSignals) -> i32 {
    let activity_points = (signals.activity_count.min(5) * 3) as i32;

    let total = contact_points(signals)
        + title_points(signals.job_title.as_deref())
        + source_points(&signals.source)
        + value_points(signals.estimated_value_cents)
        + status_points(&signals.status)
        + activity_points;

    total.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> LeadSignals {
        LeadSignals {
            source: "other".into(),
            status: "new".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_lead_scores_zero() {
        assert_eq!(score(&signals()), 0);
    }

    #[test]
    fn test_strong_lead() {
        let lead = LeadSignals {
            source: "referral".into(),
            status: "qualified".into(),
            estimated_value_cents: Some(7_500_000),
            email: Some("ceo@acme.test".into()),
            phone: Some("+1 555 0100".into()),
            job_title: Some("CEO & Founder".into()),
            company_id: Some(Uuid::new_v4()),
            activity_count: 12,
        };
        // 110 before clamping
        assert_eq!(score(&lead), 100);
    }

    #[test]
    fn test_title_points() {
        assert_eq!(title_points(Some("VP of Sales")), 20);
        assert_eq!(title_points(Some("Head of Engineering")), 20);
        assert_eq!(title_points(Some("Vice President, Ops")), 20);
        assert_eq!(title_points(Some("Account Manager")), 10);
        assert_eq!(title_points(Some("Intern")), 0);
        // "director" must be a word, not a substring
        assert_eq!(title_points(Some("Art Directorate Assistant")), 0);
        assert_eq!(title_points(None), 0);
    }

    #[test]
    fn test_unqualified_is_clamped() {
        let lead = LeadSignals {
            status: "unqualified".into(),
            email: Some("a@b.co".into()),
            ..signals()
        };
        assert_eq!(score(&lead), 0);
    }

    #[test]
    fn test_blank_contact_fields_do_not_count() {
        let lead = LeadSignals {
            email: Some("   ".into()),
            ..signals()
        };
        assert_eq!(score(&lead), 0);
    }
}
