//! Resolution of declared query variables into `<vars>` payloads.
//!
//! Each variable path is `<anchor>/<relative path>`. The anchor `$node` is
//! the match tree; any earlier variable can serve as an anchor for later
//! ones. Unresolvable variables are left out of the payload.

use std::collections::HashMap;

use crate::match_record::SearchMatch;
use crate::tree::{Element, PathExpr};
use crate::types::Variable;

pub const ROOT_ANCHOR: &str = "$node";

/// Fills `variables` of every match. Matches are annotated in place.
pub fn resolve_variables(matches: &mut [SearchMatch], variables: &[Variable]) {
    let compiled = compile_variables(variables);
    for hit in matches.iter_mut() {
        let payload = match hit.tree() {
            Ok(tree) => variables_payload(tree, &compiled),
            Err(error) => {
                tracing::warn!(
                    "cannot resolve variables, unreadable tree sentence={} error={error}",
                    hit.id()
                );
                String::new()
            }
        };
        hit.variables = format!("<vars>{payload}</vars>");
    }
}

struct CompiledVariable<'a> {
    name: &'a str,
    anchor: &'a str,
    path: PathExpr,
}

fn compile_variables(variables: &[Variable]) -> Vec<CompiledVariable<'_>> {
    variables
        .iter()
        .filter_map(|variable| {
            let Some((anchor, relative)) = variable.path.split_once('/') else {
                tracing::warn!(
                    "skipping variable without anchor name={} path={}",
                    variable.name,
                    variable.path
                );
                return None;
            };
            match PathExpr::parse(relative) {
                Ok(path) => Some(CompiledVariable {
                    name: &variable.name,
                    anchor,
                    path,
                }),
                Err(error) => {
                    tracing::warn!(
                        "skipping variable with invalid path name={} error={error}",
                        variable.name
                    );
                    None
                }
            }
        })
        .collect()
}

fn variables_payload(tree: &Element, variables: &[CompiledVariable<'_>]) -> String {
    let mut anchors: HashMap<&str, Element> = HashMap::new();
    anchors.insert(ROOT_ANCHOR, tree.clone());
    let mut payload = String::new();

    for variable in variables {
        if anchors.contains_key(variable.name) {
            continue;
        }
        let Some(anchor) = anchors.get(variable.anchor) else {
            continue;
        };
        let Some(found) = variable.path.select(anchor).first().map(|node| (*node).clone()) else {
            continue;
        };

        let mut tagged = found.clone();
        tagged.name = "var".to_string();
        tagged.set_attribute("name", variable.name);
        payload.push_str(&tagged.to_xml());
        anchors.insert(variable.name, found);
    }
    payload
}
