//! Compiled-in functions, matched by the final path component of the
//! declared image and run in-process on parsed nodes — no serialisation
//! round trip.

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};
use crate::resource::{self, ResourceNode};
use crate::results::ResultItem;

type BuiltinImpl =
    fn(Vec<ResourceNode>, Option<&Mapping>) -> Result<(Vec<ResourceNode>, Vec<ResultItem>)>;

/// One registry entry.
#[derive(Debug)]
pub struct BuiltinFn {
    pub name: &'static str,
    run: BuiltinImpl,
}

impl BuiltinFn {
    pub fn run(
        &self,
        items: Vec<ResourceNode>,
        config: Option<&Mapping>,
    ) -> Result<(Vec<ResourceNode>, Vec<ResultItem>)> {
        (self.run)(items, config)
    }
}

static REGISTRY: &[BuiltinFn] = &[
    BuiltinFn {
        name: "set-labels",
        run: set_labels,
    },
    BuiltinFn {
        name: "set-annotations",
        run: set_annotations,
    },
    BuiltinFn {
        name: "set-namespace",
        run: set_namespace,
    },
];

pub fn lookup(name: &str) -> Option<&'static BuiltinFn> {
    REGISTRY.iter().find(|b| b.name == name)
}

/// Key/value payload of the derived functionConfig: the `data` of a
/// ConfigMap-shaped config, or empty.
fn config_data(config: Option<&Mapping>) -> Mapping {
    config
        .and_then(|c| resource::get_map(c, "data"))
        .cloned()
        .unwrap_or_default()
}

fn scalar_to_string(key: &Value, value: &Value) -> Result<(String, String)> {
    let key = match key {
        Value::String(s) => s.clone(),
        other => {
            return Err(Error::Config(format!(
                "functionConfig key must be a string, got {:?}",
                other
            )))
        }
    };
    let value = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => {
            return Err(Error::Config(format!(
                "functionConfig value for {:?} must be a scalar, got {:?}",
                key, other
            )))
        }
    };
    Ok((key, value))
}

fn set_labels(
    mut items: Vec<ResourceNode>,
    config: Option<&Mapping>,
) -> Result<(Vec<ResourceNode>, Vec<ResultItem>)> {
    let data = config_data(config);
    for node in &mut items {
        for (k, v) in &data {
            let (k, v) = scalar_to_string(k, v)?;
            node.set_label(&k, &v);
        }
    }
    let results = vec![ResultItem::info(format!(
        "set {} label(s) on {} resource(s)",
        data.len(),
        items.len()
    ))];
    Ok((items, results))
}

fn set_annotations(
    mut items: Vec<ResourceNode>,
    config: Option<&Mapping>,
) -> Result<(Vec<ResourceNode>, Vec<ResultItem>)> {
    let data = config_data(config);
    for node in &mut items {
        for (k, v) in &data {
            let (k, v) = scalar_to_string(k, v)?;
            node.set_annotation(&k, &v);
        }
    }
    let results = vec![ResultItem::info(format!(
        "set {} annotation(s) on {} resource(s)",
        data.len(),
        items.len()
    ))];
    Ok((items, results))
}

fn set_namespace(
    mut items: Vec<ResourceNode>,
    config: Option<&Mapping>,
) -> Result<(Vec<ResourceNode>, Vec<ResultItem>)> {
    let data = config_data(config);
    let namespace = resource::get_str(&data, "namespace")
        .ok_or_else(|| Error::Config("set-namespace requires a namespace key".to_string()))?
        .to_string();
    for node in &mut items {
        node.set_namespace(&namespace);
    }
    let results = vec![ResultItem::info(format!(
        "namespace set to {:?} on {} resource(s)",
        namespace,
        items.len()
    ))];
    Ok((items, results))
}
