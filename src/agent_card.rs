//! Agent card directory: the public record advertised at
//! `/.well-known/agent-card.json`, plus the in-memory registry that backs it.

use crate::{AgentId, AgentRole};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A single advertised skill.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Flock-specific metadata embedded in the card (role, archetype).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardMetadata {
    pub role: AgentRole,
    #[serde(default)]
    pub archetype: Option<String>,
    pub node_id: String,
}

/// The public agent-card directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub version: String,
    pub url: String,
    pub metadata: CardMetadata,
    #[serde(default)]
    pub skills: Vec<Skill>,
}

/// Fields that can be patched via `update_card`. `skills`, when present,
/// replaces the skill set wholesale (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct CardUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub skills: Option<Vec<Skill>>,
}

struct CardEntry {
    card: AgentCard,
}

/// In-memory agent card directory with skill-tag reverse lookup.
///
/// Card mutation merges `name`/`description` and replaces `skills` wholesale;
/// updating skills re-indexes the tag map (spec.md §4.2, Testable Property 1).
pub struct CardRegistry {
    entries: DashMap<AgentId, CardEntry>,
    /// tag -> set of agent ids currently carrying it.
    tag_index: DashMap<String, HashSet<AgentId>>,
}

impl Default for CardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CardRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            tag_index: DashMap::new(),
        }
    }

    /// Register or replace a card. Duplicates replace the card wholesale.
    pub fn register(&self, agent_id: AgentId, card: AgentCard) {
        self.reindex_tags(&agent_id, &card.skills);
        self.entries.insert(agent_id, CardEntry { card });
    }

    pub fn unregister(&self, agent_id: &AgentId) {
        if let Some((_, entry)) = self.entries.remove(agent_id) {
            self.remove_from_tag_index(agent_id, &entry.card.skills);
        }
    }

    pub fn has_agent(&self, agent_id: &AgentId) -> bool {
        self.entries.contains_key(agent_id)
    }

    pub fn get_card(&self, agent_id: &AgentId) -> Option<AgentCard> {
        self.entries.get(agent_id).map(|e| e.card.clone())
    }

    pub fn list_cards(&self) -> Vec<AgentCard> {
        self.entries.iter().map(|e| e.card.clone()).collect()
    }

    /// Merge `name`/`description`; replace `skills` wholesale when present.
    pub fn update_card(&self, agent_id: &AgentId, update: CardUpdate) -> Option<AgentCard> {
        let mut entry = self.entries.get_mut(agent_id)?;
        if let Some(name) = update.name {
            entry.card.name = name;
        }
        if let Some(description) = update.description {
            entry.card.description = description;
        }
        if let Some(skills) = update.skills {
            let old_skills = std::mem::replace(&mut entry.card.skills, skills);
            drop(entry);
            self.remove_from_tag_index(agent_id, &old_skills);
            let entry = self.entries.get(agent_id)?;
            self.reindex_tags(agent_id, &entry.card.skills);
        }
        self.entries.get(agent_id).map(|e| e.card.clone())
    }

    /// Find agents whose current card carries `tag`.
    pub fn find_by_skill(&self, tag: &str) -> Vec<AgentId> {
        self.tag_index
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn reindex_tags(&self, agent_id: &AgentId, skills: &[Skill]) {
        for skill in skills {
            for tag in &skill.tags {
                self.tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(agent_id.clone());
            }
        }
    }

    fn remove_from_tag_index(&self, agent_id: &AgentId, skills: &[Skill]) {
        for skill in skills {
            for tag in &skill.tags {
                if let Some(mut set) = self.tag_index.get_mut(tag) {
                    set.remove(agent_id);
                }
            }
        }
        self.tag_index.retain(|_, set| !set.is_empty());
    }
}

/// Synthesize skills for a worker created with an archetype but no explicit
/// skill list, by extracting named items from the archetype template's
/// "Starting Focus" and "Starting Knowledge" markdown sections (spec.md
/// §4.2). Pure and idempotent given the same archetype text.
pub fn synthesize_archetype_skills(archetype: &str, template: &str) -> Vec<Skill> {
    let slug = slugify(archetype);
    let mut skills = Vec::new();

    if let Some(items) = extract_markdown_section(template, "Starting Focus") {
        for item in &items {
            skills.push(Skill {
                id: format!("{slug}-focus"),
                name: item.clone(),
                description: format!("Starting focus for {archetype}: {item}"),
                tags: vec![slug.clone()],
            });
        }
    }

    if let Some(items) = extract_markdown_section(template, "Starting Knowledge") {
        for item in &items {
            let item_slug = slugify(item);
            skills.push(Skill {
                id: format!("{slug}-{item_slug}"),
                name: item.clone(),
                description: format!("Starting knowledge for {archetype}: {item}"),
                tags: vec![slug.clone()],
            });
        }
    }

    skills
}

/// Extract the bullet items of a markdown section named `## {heading}` (or
/// `# {heading}`), stopping at the next heading of equal or lesser depth.
fn extract_markdown_section(markdown: &str, heading: &str) -> Option<Vec<String>> {
    let lines: Vec<&str> = markdown.lines().collect();
    let start = lines.iter().position(|line| {
        let trimmed = line.trim_start_matches('#').trim();
        line.trim_start().starts_with('#') && trimmed.eq_ignore_ascii_case(heading)
    })?;

    let mut items = Vec::new();
    for line in &lines[start + 1..] {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            break;
        }
        if let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        {
            let item = item.trim();
            if !item.is_empty() {
                items.push(item.to_string());
            }
        }
    }

    Some(items)
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_was_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub type SharedCardRegistry = Arc<CardRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_card(node_id: &str) -> AgentCard {
        AgentCard {
            name: "Worker Alpha".into(),
            description: "a worker".into(),
            version: "0.1.0".into(),
            url: format!("http://{node_id}/flock/a2a/worker-alpha"),
            metadata: CardMetadata {
                role: AgentRole::Worker,
                archetype: Some("researcher".into()),
                node_id: node_id.into(),
            },
            skills: vec![Skill {
                id: "research".into(),
                name: "Research".into(),
                description: "finds things".into(),
                tags: vec!["research".into(), "web".into()],
            }],
        }
    }

    #[test]
    fn update_card_reflects_in_get_and_tag_index() {
        let registry = CardRegistry::new();
        let agent_id: AgentId = "worker-alpha".into();
        registry.register(agent_id.clone(), sample_card("node-1"));

        assert_eq!(registry.find_by_skill("web"), vec![agent_id.clone()]);

        registry.update_card(
            &agent_id,
            CardUpdate {
                name: Some("Worker Alpha v2".into()),
                description: None,
                skills: Some(vec![Skill {
                    id: "coding".into(),
                    name: "Coding".into(),
                    description: "writes code".into(),
                    tags: vec!["coding".into()],
                }]),
            },
        );

        let card = registry.get_card(&agent_id).unwrap();
        assert_eq!(card.name, "Worker Alpha v2");
        assert!(registry.find_by_skill("web").is_empty());
        assert_eq!(registry.find_by_skill("coding"), vec![agent_id]);
    }

    #[test]
    fn unregister_clears_tag_index() {
        let registry = CardRegistry::new();
        let agent_id: AgentId = "worker-alpha".into();
        registry.register(agent_id.clone(), sample_card("node-1"));
        registry.unregister(&agent_id);
        assert!(registry.find_by_skill("web").is_empty());
        assert!(!registry.has_agent(&agent_id));
    }

    #[test]
    fn synthesize_skills_from_archetype_template_is_idempotent() {
        let template = r#"
# Researcher

## Starting Focus
- Literature review
- Source verification

## Starting Knowledge
- Citation formats

## Other Section
- ignored
"#;
        let first = synthesize_archetype_skills("Researcher", template);
        let second = synthesize_archetype_skills("Researcher", template);
        assert_eq!(
            first.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            second.iter().map(|s| s.id.clone()).collect::<Vec<_>>()
        );
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|s| s.tags.contains(&"researcher".to_string())));
        assert_eq!(first[0].id, "researcher-focus");
        assert_eq!(first[2].id, "researcher-citation-formats");
    }
}
