//! Service Control Protocol Description parsing: the per-service document
//! that lists every invokable action, its arguments, and the state variables
//! that give arguments their types and constraints.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xmltree::Element;

use crate::error::Error;
use crate::xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Numeric constraint range from `<allowedValueRange>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub step: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionArgument {
    pub name: String,
    pub direction: Direction,
    pub data_type: String,
    pub related_state_variable: String,
    pub allowed_values: Option<Vec<String>>,
    pub range: Option<ValueRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,
    pub data_type: String,
    pub send_events: bool,
    pub default_value: Option<String>,
    pub allowed_values: Option<Vec<String>>,
    pub range: Option<ValueRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Easy,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    MediaControl,
    VolumeControl,
    Information,
    Configuration,
    Security,
    Other,
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionCategory::MediaControl => write!(f, "media_control"),
            ActionCategory::VolumeControl => write!(f, "volume_control"),
            ActionCategory::Information => write!(f, "information"),
            ActionCategory::Configuration => write!(f, "configuration"),
            ActionCategory::Security => write!(f, "security"),
            ActionCategory::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoapAction {
    pub name: String,
    pub arguments_in: Vec<ActionArgument>,
    pub arguments_out: Vec<ActionArgument>,
    pub complexity: Complexity,
    pub category: ActionCategory,
}

/// A parsed SCPD. Actions and state variables keep declaration order;
/// per-endpoint parse problems land in `parse_errors` without failing the
/// document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScpdDocument {
    pub actions: Vec<SoapAction>,
    pub state_variables: Vec<StateVariable>,
    pub parse_errors: Vec<String>,
}

impl ScpdDocument {
    pub fn action(&self, name: &str) -> Option<&SoapAction> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.state_variables.iter().find(|v| v.name == name)
    }
}

/// Complexity from argument counts: trivial call shapes are easy, wide
/// signatures are complex, the rest sit in between.
pub fn classify_complexity(inputs: usize, outputs: usize) -> Complexity {
    if inputs >= 3 || outputs >= 4 {
        Complexity::Complex
    } else if inputs <= 1 && outputs <= 1 {
        Complexity::Easy
    } else {
        Complexity::Medium
    }
}

const SECURITY_KEYWORDS: &[&str] = &["password", "account", "security", "protect"];
const VOLUME_KEYWORDS: &[&str] = &["volume", "mute", "bass", "treble", "loudness"];
const INFO_VERBS: &[&str] = &["get", "query", "list", "browse", "read"];
const MEDIA_KEYWORDS: &[&str] = &[
    "play", "pause", "stop", "seek", "next", "previous", "uri", "transport", "queue",
];
const CONFIG_KEYWORDS: &[&str] = &["set", "configure", "edit", "update", "write"];

/// Categorize an action by name. Security and volume keywords take priority;
/// a read-style verb prefix marks the action informational even when the
/// name also mentions transport or queue (GetTransportInfo reads state).
pub fn categorize_action(name: &str) -> ActionCategory {
    let lower = name.to_lowercase();
    if SECURITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ActionCategory::Security;
    }
    if VOLUME_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ActionCategory::VolumeControl;
    }
    if INFO_VERBS.iter().any(|k| lower.starts_with(k)) {
        return ActionCategory::Information;
    }
    if MEDIA_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ActionCategory::MediaControl;
    }
    if CONFIG_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ActionCategory::Configuration;
    }
    if INFO_VERBS.iter().any(|k| lower.contains(k)) {
        return ActionCategory::Information;
    }
    ActionCategory::Other
}

/// Parse an SCPD document. A missing `<actionList>` yields an empty action
/// set; only an unparseable root is fatal.
pub fn parse_scpd(content: &str) -> Result<ScpdDocument, Error> {
    let root = xml::parse(content)?;
    let mut document = ScpdDocument::default();

    parse_state_table(&root, &mut document);
    parse_action_list(&root, &mut document);
    resolve_argument_types(&mut document);

    Ok(document)
}

fn parse_state_table(root: &Element, document: &mut ScpdDocument) {
    let Some(table) = xml::find_descendant(root, "serviceStateTable") else {
        return;
    };
    for var in xml::find_children(table, "stateVariable") {
        let Some(name) = xml::child_text(var, "name") else {
            document
                .parse_errors
                .push("state variable missing name".into());
            continue;
        };
        let send_events = var
            .attributes
            .get("sendEvents")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(true);
        document.state_variables.push(StateVariable {
            name,
            data_type: xml::child_text(var, "dataType").unwrap_or_else(|| "string".into()),
            send_events,
            default_value: xml::child_text(var, "defaultValue"),
            allowed_values: parse_allowed_values(var),
            range: parse_range(var),
        });
    }
}

fn parse_allowed_values(var: &Element) -> Option<Vec<String>> {
    let list = xml::find_child(var, "allowedValueList")?;
    let values: Vec<String> = xml::find_children(list, "allowedValue")
        .iter()
        .filter_map(|v| v.get_text().map(|t| t.trim().to_string()))
        .collect();
    if values.is_empty() { None } else { Some(values) }
}

fn parse_range(var: &Element) -> Option<ValueRange> {
    let range = xml::find_child(var, "allowedValueRange")?;
    let parse_bound = |name: &str| {
        xml::child_text(range, name).and_then(|v| v.parse::<i64>().ok())
    };
    Some(ValueRange {
        min: parse_bound("minimum"),
        max: parse_bound("maximum"),
        step: parse_bound("step"),
    })
}

fn parse_action_list(root: &Element, document: &mut ScpdDocument) {
    let Some(list) = xml::find_descendant(root, "actionList") else {
        return;
    };
    for action in xml::find_children(list, "action") {
        let Some(name) = xml::child_text(action, "name") else {
            document.parse_errors.push("action missing name".into());
            continue;
        };

        let mut arguments_in = Vec::new();
        let mut arguments_out = Vec::new();
        if let Some(arg_list) = xml::find_child(action, "argumentList") {
            for arg in xml::find_children(arg_list, "argument") {
                let Some(arg_name) = xml::child_text(arg, "name") else {
                    document
                        .parse_errors
                        .push(format!("argument missing name in action {}", name));
                    continue;
                };
                let direction = match xml::child_text(arg, "direction").as_deref() {
                    Some(d) if d.eq_ignore_ascii_case("out") => Direction::Out,
                    _ => Direction::In,
                };
                let argument = ActionArgument {
                    name: arg_name,
                    direction,
                    data_type: xml::child_text(arg, "dataType").unwrap_or_default(),
                    related_state_variable: xml::child_text(arg, "relatedStateVariable")
                        .unwrap_or_default(),
                    allowed_values: None,
                    range: None,
                };
                match direction {
                    Direction::In => arguments_in.push(argument),
                    Direction::Out => arguments_out.push(argument),
                }
            }
        }

        document.actions.push(SoapAction {
            complexity: classify_complexity(arguments_in.len(), arguments_out.len()),
            category: categorize_action(&name),
            name,
            arguments_in,
            arguments_out,
        });
    }
}

/// Pull data types and constraints into arguments from their related state
/// variables; arguments without a resolvable variable keep any declared
/// type or default to "string".
fn resolve_argument_types(document: &mut ScpdDocument) {
    let variables: HashMap<String, StateVariable> = document
        .state_variables
        .iter()
        .map(|v| (v.name.clone(), v.clone()))
        .collect();

    for action in &mut document.actions {
        for arg in action
            .arguments_in
            .iter_mut()
            .chain(action.arguments_out.iter_mut())
        {
            if let Some(var) = variables.get(&arg.related_state_variable) {
                arg.data_type = var.data_type.clone();
                arg.allowed_values = var.allowed_values.clone();
                arg.range = var.range.clone();
            } else if arg.data_type.is_empty() {
                arg.data_type = "string".into();
            }
        }
    }
}
