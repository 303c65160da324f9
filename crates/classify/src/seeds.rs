//! Seed dictionary for archetype scoring.
//!
//! Each archetype carries three signal sources:
//!   * verb patterns: regex templates with a `{tech}` noun wildcard, worth
//!     1.0 point per matching sentence;
//!   * indicators: fixed phrases worth 0.5;
//!   * seed phrases: embedded once at startup, averaged into the archetype's
//!     seed centroid for the similarity term.
//!
//! Keyword presence alone conflates archetypes ("platform" appears in every
//! JD); the verb in context is the signal.

use anyhow::{Context, Result};
use regex::Regex;

use quarry_embed::{Embedder, mean_vector};
use quarry_store::Archetype;

/// Tech-noun wildcard substituted for `{tech}` in verb-pattern templates.
const TECH_NOUNS: &str = "platform|platforms|pipeline|pipelines|service|services|system|systems|\
api|apis|warehouse|lakehouse|application|applications|infrastructure|architecture|product|\
tooling|framework|model|models|dashboard|dashboards|integration|integrations|etl|database|databases";

struct SeedDef {
    archetype: Archetype,
    verb_templates: &'static [&'static str],
    indicators: &'static [&'static str],
    seed_phrases: &'static [&'static str],
}

const SEED_DEFS: &[SeedDef] = &[
    SeedDef {
        archetype: Archetype::Builder,
        verb_templates: &[
            r"\b(design|architect|build|create|develop|implement|deliver|stand up)\w*\b[^.!?]{0,80}\b(new|greenfield|next.generation|modern)\b[^.!?]{0,80}\b({tech})\b",
            r"\b({tech})\b[^.!?]{0,40}\bfrom (?:scratch|the ground up)\b",
            r"\b(launch|prototype|pilot|bootstrap)\w*\b[^.!?]{0,60}\b({tech})\b",
        ],
        indicators: &[
            "from the ground up",
            "from scratch",
            "greenfield",
            "ground floor",
            "zero to one",
            "net new",
            "first engineer",
        ],
        seed_phrases: &[
            "design and build a new data platform from scratch",
            "greenfield development of cloud native services",
            "stand up new infrastructure and pipelines",
            "architect a brand new system end to end",
        ],
    },
    SeedDef {
        archetype: Archetype::Fixer,
        verb_templates: &[
            r"\b(migrat\w+|modernis\w+|moderniz\w+|replatform\w*|re-platform\w*|rearchitect\w*|re-architect\w*|refactor\w*|consolidat\w+|upgrad\w+)\b[^.!?]{0,80}\b({tech})\b",
            r"\b(retire|decommission|sunset|replace)\w*\b[^.!?]{0,80}\b(legacy|aging|ageing|outdated|old)\b",
            r"\b(legacy|aging|ageing|monolith\w*|outdated)\b[^.!?]{0,60}\b({tech})\b",
            r"\b(stabilis\w+|stabiliz\w+|remediat\w+|untangle\w*)\b[^.!?]{0,60}\b({tech})\b",
        ],
        indicators: &[
            "technical debt",
            "legacy",
            "end of life",
            "cutover",
            "lift and shift",
            "modernisation",
            "modernization",
            "migration project",
        ],
        seed_phrases: &[
            "migrate the legacy warehouse to a modern cloud platform",
            "modernise aging etl pipelines",
            "replatform from on premise to the cloud",
            "retire legacy systems after cutover",
        ],
    },
    SeedDef {
        archetype: Archetype::Operator,
        verb_templates: &[
            r"\b(maintain\w*|support\w*|operate\w*|monitor\w*|administer\w*|administrat\w+)\b[^.!?]{0,80}\b({tech})\b",
            r"\b(respond|triage|resolve)\w*\b[^.!?]{0,60}\b(incidents?|alerts?|tickets?|outages?)\b",
            r"\b(business as usual|bau|day.to.day)\b[^.!?]{0,60}\b(operations?|support|running)\b",
        ],
        indicators: &[
            "on-call",
            "on call",
            "24/7",
            "production support",
            "keep the lights on",
            "incident response",
            "service levels",
        ],
        seed_phrases: &[
            "maintain and support production data pipelines",
            "monitor platform health and respond to incidents",
            "operate the existing warehouse day to day",
            "provide ongoing administration and support",
        ],
    },
    SeedDef {
        archetype: Archetype::Translator,
        verb_templates: &[
            r"\b(translat\w+|liais\w+|bridge|align\w*|communicat\w+|present\w*)\b[^.!?]{0,80}\b(stakeholders?|business|executives?|leadership|non.technical)\b",
            r"\b(workshops?|training|enable\w*|coach\w*|mentor\w*|upskill\w*)\b[^.!?]{0,60}\b(teams?|analysts?|users|stakeholders?)\b",
            r"\b(gather|elicit|capture)\w*\b[^.!?]{0,40}\brequirements?\b",
        ],
        indicators: &[
            "stakeholder management",
            "non-technical audiences",
            "bridge the gap",
            "business outcomes",
            "trusted advisor",
            "data literacy",
            "executive reporting",
        ],
        seed_phrases: &[
            "work with stakeholders to translate business requirements",
            "present insights to non technical audiences",
            "run workshops to enable analyst teams",
            "bridge the gap between business and engineering",
        ],
    },
];

/// One archetype's compiled seed entry.
pub struct ArchetypeSeed {
    pub archetype: Archetype,
    pub verb_patterns: Vec<Regex>,
    pub indicators: &'static [&'static str],
    pub seed_phrases: &'static [&'static str],
}

/// The full compiled dictionary, in `Archetype::ALL` order.
pub struct SeedBank {
    seeds: Vec<ArchetypeSeed>,
}

impl SeedBank {
    pub fn compile() -> Result<Self> {
        let mut seeds = Vec::with_capacity(SEED_DEFS.len());
        for def in SEED_DEFS {
            let mut verb_patterns = Vec::with_capacity(def.verb_templates.len());
            for template in def.verb_templates {
                let pattern = template.replace("{tech}", TECH_NOUNS);
                let regex = Regex::new(&format!("(?i){pattern}"))
                    .with_context(|| format!("compiling {} pattern", def.archetype.slug()))?;
                verb_patterns.push(regex);
            }
            seeds.push(ArchetypeSeed {
                archetype: def.archetype,
                verb_patterns,
                indicators: def.indicators,
                seed_phrases: def.seed_phrases,
            });
        }
        Ok(Self { seeds })
    }

    pub fn get(&self, archetype: Archetype) -> &ArchetypeSeed {
        self.seeds
            .iter()
            .find(|s| s.archetype == archetype)
            .expect("seed bank covers every archetype")
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchetypeSeed> {
        self.seeds.iter()
    }
}

/// Mean embedding of each archetype's seed phrases.  Rebuilt at startup and
/// whenever the embedding model version changes.
pub struct SeedCentroids {
    centroids: Vec<(Archetype, Vec<f32>)>,
}

impl SeedCentroids {
    #[cfg(test)]
    pub(crate) fn from_parts(centroids: Vec<(Archetype, Vec<f32>)>) -> Self {
        Self { centroids }
    }

    pub async fn build(bank: &SeedBank, embedder: &dyn Embedder) -> Result<Self> {
        let mut centroids = Vec::with_capacity(4);
        for seed in bank.iter() {
            let phrases: Vec<String> = seed.seed_phrases.iter().map(|s| s.to_string()).collect();
            let vectors = embedder
                .embed_batch(&phrases)
                .await
                .with_context(|| format!("embedding {} seed phrases", seed.archetype.slug()))?;
            let centroid = mean_vector(&vectors)
                .with_context(|| format!("no seed vectors for {}", seed.archetype.slug()))?;
            centroids.push((seed.archetype, centroid));
        }
        Ok(Self { centroids })
    }

    pub fn get(&self, archetype: Archetype) -> Option<&[f32]> {
        self.centroids
            .iter()
            .find(|(a, _)| *a == archetype)
            .map(|(_, v)| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_archetype_compiles_and_is_covered() {
        let bank = SeedBank::compile().expect("seed bank compiles");
        for archetype in Archetype::ALL {
            let seed = bank.get(archetype);
            assert!(!seed.verb_patterns.is_empty());
            assert!(!seed.indicators.is_empty());
            assert!(!seed.seed_phrases.is_empty());
        }
    }

    #[test]
    fn builder_pattern_hits_greenfield_phrasing() {
        let bank = SeedBank::compile().expect("seed bank compiles");
        let builder = bank.get(Archetype::Builder);
        let sentence = "design and implement a new cloud-native data platform from the ground up";
        let hits = builder
            .verb_patterns
            .iter()
            .filter(|p| p.is_match(sentence))
            .count();
        assert!(hits >= 1, "expected at least one builder pattern hit");
    }

    #[test]
    fn fixer_pattern_hits_migration_phrasing() {
        let bank = SeedBank::compile().expect("seed bank compiles");
        let fixer = bank.get(Archetype::Fixer);
        let sentence = "Migrate legacy Redshift warehouse to Snowflake and retire aging ETL";
        let hits = fixer
            .verb_patterns
            .iter()
            .filter(|p| p.is_match(sentence))
            .count();
        assert!(hits >= 2, "expected migrate + retire hits, got {hits}");
    }

    #[tokio::test]
    async fn seed_centroids_cover_every_archetype() -> anyhow::Result<()> {
        let bank = SeedBank::compile()?;
        let embedder = quarry_embed::HashEmbedder::new(64);
        let centroids = SeedCentroids::build(&bank, &embedder).await?;
        for archetype in Archetype::ALL {
            assert!(centroids.get(archetype).is_some());
        }
        Ok(())
    }
}
