//! Deterministic metadata extraction: role type, seniority, technology tags.
//! Runs at ingest time, before (and independently of) archetype scoring.

use quarry_store::{ListingMeta, RoleType, Seniority};

/// Technology vocabulary scanned for tag extraction.  Matching is
/// case-insensitive on word boundaries; multi-word entries match as phrases.
const TECH_TAGS: &[&str] = &[
    "python", "sql", "rust", "java", "scala", "go",
    "aws", "azure", "gcp", "terraform", "docker", "kubernetes",
    "snowflake", "redshift", "databricks", "bigquery", "postgres", "mysql",
    "spark", "kafka", "airflow", "dbt", "flink", "hadoop",
    "tableau", "power bi", "looker",
];

const CONTRACT_MARKERS: &[&str] = &[
    "contract", "day rate", "daily rate", "fixed term", "fixed-term", "contractor",
];

const PERMANENT_MARKERS: &[&str] = &["permanent", "full-time", "full time", "perm role"];

pub fn extract_metadata(title: &str, body: &str) -> ListingMeta {
    let haystack = format!("{title}\n{body}").to_lowercase();

    let role_type = if CONTRACT_MARKERS.iter().any(|m| haystack.contains(m)) {
        RoleType::Contract
    } else if PERMANENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        RoleType::Permanent
    } else {
        RoleType::Unknown
    };

    ListingMeta {
        role_type,
        seniority: seniority_from_title(title),
        tech_tags: extract_tech_tags(&haystack),
    }
}

/// Seniority comes from the title alone; bodies mention every level.
fn seniority_from_title(title: &str) -> Seniority {
    let title = title.to_lowercase();
    let has = |needle: &str| {
        title
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == needle)
    };

    if has("lead") || has("principal") || has("head") || has("staff") {
        Seniority::Lead
    } else if has("senior") || has("sr") {
        Seniority::Senior
    } else if has("junior") || has("graduate") || has("entry") {
        Seniority::Junior
    } else if has("mid") || has("intermediate") {
        Seniority::Mid
    } else {
        Seniority::Unknown
    }
}

pub fn extract_tech_tags(haystack_lower: &str) -> Vec<String> {
    let mut tags: Vec<String> = TECH_TAGS
        .iter()
        .filter(|tag| contains_word(haystack_lower, tag))
        .map(|tag| tag.to_string())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

/// Word-boundary containment: "go" must not match "google".
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let boundary_before = begin == 0
            || !haystack[..begin]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let boundary_after = end == haystack.len()
            || !haystack[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if boundary_before && boundary_after {
            return true;
        }
        start = end;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_marker_sets_role_type() {
        let meta = extract_metadata(
            "Data Engineer",
            "6 month contract with a daily rate on offer.",
        );
        assert_eq!(meta.role_type, RoleType::Contract);
    }

    #[test]
    fn permanent_marker_sets_role_type() {
        let meta = extract_metadata("Data Engineer", "This is a permanent full-time position.");
        assert_eq!(meta.role_type, RoleType::Permanent);
    }

    #[test]
    fn absent_markers_leave_role_unknown() {
        let meta = extract_metadata("Data Engineer", "Great team, great coffee.");
        assert_eq!(meta.role_type, RoleType::Unknown);
    }

    #[test]
    fn seniority_reads_the_title_not_the_body() {
        let meta = extract_metadata(
            "Senior Data Engineer",
            "You will mentor junior engineers and report to the lead architect.",
        );
        assert_eq!(meta.seniority, Seniority::Senior);
    }

    #[test]
    fn tech_tags_are_sorted_and_word_bounded() {
        let meta = extract_metadata(
            "Data Engineer",
            "Experience with Snowflake, dbt and Airflow. We use Google Workspace.",
        );
        assert_eq!(meta.tech_tags, vec!["airflow", "dbt", "snowflake"]);
        // "go" must not be extracted from "Google".
        assert!(!meta.tech_tags.contains(&"go".to_string()));
    }

    #[test]
    fn multi_word_tags_match_as_phrases() {
        let tags = extract_tech_tags("dashboards built in power bi and tableau");
        assert!(tags.contains(&"power bi".to_string()));
        assert!(tags.contains(&"tableau".to_string()));
    }
}
