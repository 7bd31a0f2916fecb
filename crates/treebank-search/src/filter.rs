//! Late-bound filters over cached matches.
//!
//! Filters are plain data ([`FilterOp`]) so a pipeline can be built from
//! request flags, logged and compared. [`FilterPipeline`] compiles them once
//! and applies them in registration order. Tree faults never drop a match:
//! the fault is logged and the match passes through unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::match_record::SearchMatch;
use crate::tree::{Element, PathExpr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterOp {
    /// Keep matches whose tree matches `pattern`.
    Include { pattern: String },
    /// Drop matches whose tree matches `pattern`.
    Exclude { pattern: String },
    /// Expand index nodes in the match tree.
    Expand,
    /// Attach descriptive attributes of the hit.
    Annotate { queries: Vec<String> },
}

/// Request flags that select filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Behaviour {
    /// When set, the engine runs the query's own string and only matches
    /// whose tree also matches this pattern are kept.
    pub subset_pattern: Option<String>,
    pub expand_index: bool,
    pub annotation_queries: Vec<String>,
    pub exclusions: Vec<String>,
}

impl Behaviour {
    /// Filters in application order: expand, annotate, include, exclude.
    pub fn filters(&self) -> Vec<FilterOp> {
        let mut ops = Vec::new();
        if self.expand_index {
            ops.push(FilterOp::Expand);
        }
        if !self.annotation_queries.is_empty() {
            ops.push(FilterOp::Annotate {
                queries: self.annotation_queries.clone(),
            });
        }
        if let Some(pattern) = &self.subset_pattern {
            ops.push(FilterOp::Include {
                pattern: pattern.clone(),
            });
        }
        ops.extend(self.exclusions.iter().map(|pattern| FilterOp::Exclude {
            pattern: pattern.clone(),
        }));
        ops
    }
}

/// Rewrites a match tree. The input tree is never modified.
pub trait TreeExpander: Send + Sync {
    fn expand(&self, tree: &Element) -> Result<Element>;
}

/// Derives descriptive attributes for a match.
pub trait HitAnnotator: Send + Sync {
    fn annotate(&self, hit: &mut SearchMatch, queries: &[String]) -> Result<()>;
}

enum Stage {
    Include(PathExpr),
    Exclude(PathExpr),
    Expand,
    Annotate(Vec<String>),
}

/// Compiled filters plus the expander and annotator they use.
pub struct FilterPipeline {
    ops: Vec<FilterOp>,
    stages: Vec<Stage>,
    expander: Arc<dyn TreeExpander>,
    annotator: Arc<dyn HitAnnotator>,
}

impl FilterPipeline {
    pub fn new(expander: Arc<dyn TreeExpander>, annotator: Arc<dyn HitAnnotator>) -> Self {
        Self {
            ops: Vec::new(),
            stages: Vec::new(),
            expander,
            annotator,
        }
    }

    /// Appends `op`. Fails when its pattern does not parse.
    pub fn push(&mut self, op: FilterOp) -> Result<()> {
        let stage = match &op {
            FilterOp::Include { pattern } => Stage::Include(PathExpr::parse(pattern)?),
            FilterOp::Exclude { pattern } => Stage::Exclude(PathExpr::parse(pattern)?),
            FilterOp::Expand => Stage::Expand,
            FilterOp::Annotate { queries } => Stage::Annotate(queries.clone()),
        };
        self.stages.push(stage);
        self.ops.push(op);
        Ok(())
    }

    pub fn ops(&self) -> &[FilterOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, matches: Vec<SearchMatch>) -> Vec<SearchMatch> {
        matches
            .into_iter()
            .filter_map(|hit| self.apply_one(hit))
            .collect()
    }

    fn apply_one(&self, mut hit: SearchMatch) -> Option<SearchMatch> {
        for stage in &self.stages {
            match stage {
                Stage::Include(pattern) => {
                    if tree_matches(&mut hit, pattern) == Some(false) {
                        return None;
                    }
                }
                Stage::Exclude(pattern) => {
                    if tree_matches(&mut hit, pattern) == Some(true) {
                        return None;
                    }
                }
                Stage::Expand => {
                    let expanded = hit.tree().and_then(|tree| self.expander.expand(tree));
                    match expanded {
                        Ok(tree) => hit.set_tree(tree),
                        Err(error) => tracing::warn!(
                            "failed expanding index nodes sentence={} error={error}",
                            hit.id()
                        ),
                    }
                }
                Stage::Annotate(queries) => {
                    if let Err(error) = self.annotator.annotate(&mut hit, queries) {
                        tracing::warn!(
                            "failed annotating hit sentence={} error={error}",
                            hit.id()
                        );
                    }
                }
            }
        }
        Some(hit)
    }
}

/// `None` when the tree cannot be parsed; the caller keeps the match.
fn tree_matches(hit: &mut SearchMatch, pattern: &PathExpr) -> Option<bool> {
    match hit.tree() {
        Ok(tree) => Some(pattern.matches(tree)),
        Err(error) => {
            tracing::warn!("unreadable match tree sentence={} error={error}", hit.id());
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Index node expansion
// ---------------------------------------------------------------------------

/// Fills empty coindexed nodes with a copy of their antecedent.
///
/// In the treebank format a constituent that is shared between positions is
/// spelled out once (the antecedent, which has content) and referred to by
/// bare nodes carrying only the same `index`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexNodeExpander;

impl TreeExpander for IndexNodeExpander {
    fn expand(&self, tree: &Element) -> Result<Element> {
        let mut antecedents = BTreeMap::new();
        for element in tree.self_and_descendants() {
            if let Some(index) = element.attribute("index") {
                if has_content(element) {
                    antecedents.entry(index.to_string()).or_insert(element);
                }
            }
        }

        let mut expanded = tree.clone();
        fill_index_nodes(&mut expanded, &antecedents)?;
        Ok(expanded)
    }
}

fn has_content(element: &Element) -> bool {
    !element.children.is_empty()
        || element.attribute("cat").is_some()
        || element.attribute("word").is_some()
}

fn fill_index_nodes(element: &mut Element, antecedents: &BTreeMap<String, &Element>) -> Result<()> {
    if !has_content(element) {
        if let Some(index) = element.attribute("index").map(str::to_string) {
            let antecedent = antecedents.get(&index).ok_or_else(|| {
                SearchError::Annotation(format!("no antecedent for index node {index}"))
            })?;
            for (name, value) in &antecedent.attributes {
                if element.attribute(name).is_none() {
                    element.set_attribute(name, value);
                }
            }
            element.children = antecedent.children.clone();
            return Ok(());
        }
    }
    for child in &mut element.children {
        fill_index_nodes(child, antecedents)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Hit annotation
// ---------------------------------------------------------------------------

/// Describes the hit: the deepest node spanning every word of the match.
///
/// Attributes: `hit_cat`, `hit_rel`, `hit_fringe` (words in sentence
/// order), `hit_lemmas` and `annotation_queries` (those of the given
/// queries that match the hit), the last two as sorted `;`-joined sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct HitAttributes;

impl HitAnnotator for HitAttributes {
    fn annotate(&self, hit: &mut SearchMatch, queries: &[String]) -> Result<()> {
        let begins = hit
            .begin_positions()?
            .into_iter()
            .map(|begin| begin.to_string())
            .collect::<BTreeSet<_>>();
        let sentence_id = hit.id().to_string();
        let tree = hit.tree()?;

        let positions = tree.positions_where(&|element| {
            element
                .attribute("begin")
                .is_some_and(|begin| begins.contains(begin))
        });
        let Some(common) = common_prefix(&positions) else {
            return Ok(());
        };
        let node = tree.at_position(&common).ok_or_else(|| {
            SearchError::Annotation(format!("hit node missing in sentence {sentence_id}"))
        })?;

        let mut words = node
            .self_and_descendants()
            .into_iter()
            .filter_map(|element| {
                let word = element.attribute("word")?;
                let begin = element
                    .attribute("begin")
                    .and_then(|begin| begin.parse::<i64>().ok())
                    .unwrap_or(i64::MAX);
                Some((begin, word.to_string()))
            })
            .collect::<Vec<_>>();
        words.sort();

        let lemmas = node
            .self_and_descendants()
            .into_iter()
            .filter_map(|element| element.attribute("lemma"))
            .collect::<BTreeSet<_>>();

        let mut matched = BTreeSet::new();
        for query in queries {
            match PathExpr::parse(query) {
                Ok(pattern) if pattern.matches(node) => {
                    matched.insert(query.as_str());
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!("skipping unparsable annotation query query={query} error={error}")
                }
            }
        }

        let mut attributes = BTreeMap::new();
        attributes.insert(
            "hit_cat".to_string(),
            node.attribute("cat")
                .or_else(|| node.attribute("pt"))
                .unwrap_or_default()
                .to_string(),
        );
        attributes.insert(
            "hit_rel".to_string(),
            node.attribute("rel").unwrap_or_default().to_string(),
        );
        attributes.insert(
            "hit_fringe".to_string(),
            words
                .into_iter()
                .map(|(_, word)| word)
                .collect::<Vec<_>>()
                .join(" "),
        );
        attributes.insert(
            "hit_lemmas".to_string(),
            lemmas.into_iter().collect::<Vec<_>>().join(";"),
        );
        attributes.insert(
            "annotation_queries".to_string(),
            matched.into_iter().collect::<Vec<_>>().join(";"),
        );

        hit.attributes.extend(attributes);
        Ok(())
    }
}

fn common_prefix(positions: &[Vec<usize>]) -> Option<Vec<usize>> {
    let (first, rest) = positions.split_first()?;
    let mut prefix = first.clone();
    for position in rest {
        let shared = prefix
            .iter()
            .zip(position)
            .take_while(|(left, right)| left == right)
            .count();
        prefix.truncate(shared);
    }
    Some(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_record::parse_records;
    use crate::types::PartitionId;

    const TREE: &str = r#"<alpino_ds><node cat="top" begin="0"><node cat="smain" rel="--" begin="0"><node rel="su" pt="vnw" word="Dit" lemma="dit" begin="0" index="1"/><node rel="hd" pt="ww" word="is" lemma="zijn" begin="1"/><node rel="predc" cat="np" begin="2"><node rel="det" pt="lid" word="een" lemma="een" begin="2"/><node rel="hd" pt="n" word="voorbeeld" lemma="voorbeeld" begin="3"/></node><node rel="su" index="1"/></node></node></alpino_ds>"#;

    fn hit(begins: &str, tree: &str) -> SearchMatch {
        let text = format!("<match>s1||Dit is een voorbeeld||1||{begins}||{tree}||m||v||db</match>");
        parse_records(&text, &PartitionId::new("p"))
            .expect("parse")
            .remove(0)
    }

    fn pipeline(ops: Vec<FilterOp>) -> FilterPipeline {
        let mut pipeline = FilterPipeline::new(Arc::new(IndexNodeExpander), Arc::new(HitAttributes));
        for op in ops {
            pipeline.push(op).expect("push");
        }
        pipeline
    }

    #[test]
    fn behaviour_orders_filters() {
        let behaviour = Behaviour {
            subset_pattern: Some("//node[@cat='np']".to_string()),
            expand_index: true,
            annotation_queries: vec!["//node".to_string()],
            exclusions: vec!["//node[@pt='lid']".to_string(), "//node[@pt='adj']".to_string()],
        };
        let ops = behaviour.filters();
        assert_eq!(ops.len(), 5);
        assert_eq!(ops[0], FilterOp::Expand);
        assert!(matches!(ops[1], FilterOp::Annotate { .. }));
        assert!(matches!(ops[2], FilterOp::Include { .. }));
        assert!(matches!(ops[4], FilterOp::Exclude { ref pattern } if pattern.contains("adj")));
        assert!(Behaviour::default().filters().is_empty());
    }

    #[test]
    fn include_and_exclude() {
        let matches = vec![hit("0", TREE), hit("0", "<node cat=\"np\"/>")];
        let kept = pipeline(vec![FilterOp::Include {
            pattern: r#"//node[@cat="smain"]"#.to_string(),
        }])
        .apply(matches.clone());
        assert_eq!(kept.len(), 1);

        let kept = pipeline(vec![FilterOp::Exclude {
            pattern: r#"//node[@cat="smain"]"#.to_string(),
        }])
        .apply(matches);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].xml_sentences, "<node cat=\"np\"/>");
    }

    #[test]
    fn unreadable_trees_pass_through() {
        let broken = hit("0", "<node><node>");
        let kept = pipeline(vec![
            FilterOp::Expand,
            FilterOp::Include {
                pattern: "//node[@cat='x']".to_string(),
            },
            FilterOp::Annotate { queries: Vec::new() },
        ])
        .apply(vec![broken]);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].attributes.is_empty());
    }

    #[test]
    fn invalid_pattern_is_rejected_on_push() {
        let mut pipeline = pipeline(Vec::new());
        let err = pipeline
            .push(FilterOp::Include {
                pattern: "//node[".to_string(),
            })
            .expect_err("invalid pattern");
        assert!(matches!(err, SearchError::Pattern(_)));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn expansion_fills_index_nodes_on_a_copy() {
        let tree = Element::parse(TREE).expect("tree");
        let expanded = IndexNodeExpander.expand(&tree).expect("expand");
        let filled = PathExpr::parse(r#"//node[@index="1" and @word="Dit"]"#)
            .expect("pattern")
            .select(&expanded);
        assert_eq!(filled.len(), 2);
        assert_eq!(filled[1].attribute("rel"), Some("su"));

        let original = PathExpr::parse(r#"//node[@index="1" and @word]"#)
            .expect("pattern")
            .select(&tree);
        assert_eq!(original.len(), 1);
    }

    #[test]
    fn expansion_without_antecedent_fails() {
        let tree = Element::parse(r#"<node cat="smain"><node rel="su" index="4"/></node>"#)
            .expect("tree");
        assert!(matches!(
            IndexNodeExpander.expand(&tree),
            Err(SearchError::Annotation(_))
        ));
    }

    #[test]
    fn expand_filter_keeps_serialized_tree() {
        let kept = pipeline(vec![
            FilterOp::Expand,
            FilterOp::Include {
                pattern: r#"//node[@index="1" and not(@word)]"#.to_string(),
            },
        ])
        .apply(vec![hit("0", TREE)]);
        assert!(kept.is_empty());

        let mut kept = pipeline(vec![FilterOp::Expand]).apply(vec![hit("0", TREE)]);
        assert_eq!(kept[0].xml_sentences, TREE);
        let tree = kept[0].tree().expect("tree");
        assert_eq!(
            PathExpr::parse("//node[@word='Dit']")
                .expect("pattern")
                .select(tree)
                .len(),
            2
        );
    }

    #[test]
    fn annotation_describes_common_ancestor() {
        let mut kept = pipeline(vec![FilterOp::Annotate {
            queries: vec![
                "node[@rel='det']".to_string(),
                "node[@rel='obj1']".to_string(),
            ],
        }])
        .apply(vec![hit("2-3", TREE)]);
        let attributes = &kept.remove(0).attributes;
        assert_eq!(attributes["hit_cat"], "np");
        assert_eq!(attributes["hit_rel"], "predc");
        assert_eq!(attributes["hit_fringe"], "een voorbeeld");
        assert_eq!(attributes["hit_lemmas"], "een;voorbeeld");
        assert_eq!(attributes["annotation_queries"], "node[@rel='det']");
    }

    #[test]
    fn single_word_hit_is_the_word_node() {
        let mut kept = pipeline(vec![FilterOp::Annotate { queries: Vec::new() }])
            .apply(vec![hit("1", TREE)]);
        let attributes = &kept.remove(0).attributes;
        assert_eq!(attributes["hit_cat"], "ww");
        assert_eq!(attributes["hit_fringe"], "is");
    }
}
