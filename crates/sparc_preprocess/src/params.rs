//! Declared method parameters and request validation.
//!
//! A [`MethodCatalog`] lists the correction methods offered to clients with
//! their parameter specs. It comes from the built-in declarations or from a
//! YAML file shaped as:
//!
//! ```yaml
//! background:
//!   methods:
//!     - name: basic
//!       label: BaSiC
//!       parameters:
//!         - name: rolling_ball_radius
//!           type: integer
//!           default: 50
//!           minimum: 0
//!           maximum: 500
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::method::BackgroundMethod;

/// Rejection of a preprocessing request's method or parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    #[error("Unsupported parameter '{0}'")]
    Unsupported(String),

    #[error("Parameter '{name}' must be a number")]
    NotNumeric { name: String },

    #[error("Parameter '{name}' below minimum {minimum}")]
    BelowMinimum { name: String, minimum: f64 },

    #[error("Parameter '{name}' above maximum {maximum}")]
    AboveMaximum { name: String, maximum: f64 },

    #[error("Parameter '{name}' must be one of {choices}")]
    InvalidChoice { name: String, choices: String },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read preprocessing config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid preprocessing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Preprocessing config declares unsupported method '{0}'")]
    UnsupportedMethod(String),

    #[error("Preprocessing config declares method '{0}' more than once")]
    DuplicateMethod(String),
}

fn default_parameter_type() -> String {
    "number".to_string()
}

/// One declared parameter of a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default = "default_parameter_type")]
    pub kind: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    fn numeric(name: &str, label: &str, kind: &str, default: Value) -> Self {
        Self {
            name: name.to_string(),
            label: Some(label.to_string()),
            kind: kind.to_string(),
            default: Some(default),
            minimum: None,
            maximum: None,
            choices: None,
            description: None,
        }
    }

    fn bounded(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    fn described(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn is_numeric(&self) -> bool {
        matches!(self.kind.as_str(), "number" | "integer" | "float")
    }

    fn check(&self, value: &Value) -> Result<(), ParameterError> {
        if let Some(number) = value.as_f64() {
            if let Some(minimum) = self.minimum {
                if number < minimum {
                    return Err(ParameterError::BelowMinimum {
                        name: self.name.clone(),
                        minimum,
                    });
                }
            }
            if let Some(maximum) = self.maximum {
                if number > maximum {
                    return Err(ParameterError::AboveMaximum {
                        name: self.name.clone(),
                        maximum,
                    });
                }
            }
        } else if self.is_numeric() {
            return Err(ParameterError::NotNumeric {
                name: self.name.clone(),
            });
        }

        if let Some(choices) = &self.choices {
            if !choices.iter().any(|choice| same_value(choice, value)) {
                let rendered = serde_json::to_string(choices).unwrap_or_default();
                return Err(ParameterError::InvalidChoice {
                    name: self.name.clone(),
                    choices: rendered,
                });
            }
        }
        Ok(())
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// A correction method as offered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl MethodSpec {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    background: BackgroundSection,
}

#[derive(Deserialize)]
struct BackgroundSection {
    #[serde(default)]
    methods: Vec<MethodSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodCatalog {
    methods: Vec<MethodSpec>,
}

impl Default for MethodCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MethodCatalog {
    /// Declarations for every registered method.
    pub fn builtin() -> Self {
        let methods = vec![
            MethodSpec {
                name: BackgroundMethod::Basic.as_str().to_string(),
                label: Some("BaSiC".to_string()),
                description: Some("Rolling-ball background estimation.".to_string()),
                parameters: vec![ParameterSpec::numeric(
                    "rolling_ball_radius",
                    "Rolling ball radius",
                    "integer",
                    Value::from(50),
                )
                .bounded(Some(0.0), Some(500.0))
                .described("Ball radius in pixels; values below 1 run as 1.")],
            },
            MethodSpec {
                name: BackgroundMethod::Polynomial.as_str().to_string(),
                label: Some("Polynomial".to_string()),
                description: Some("Least-squares polynomial surface fit.".to_string()),
                parameters: vec![ParameterSpec::numeric("order", "Polynomial order", "integer", Value::from(2))
                    .bounded(Some(1.0), Some(5.0))],
            },
            MethodSpec {
                name: BackgroundMethod::Morphological.as_str().to_string(),
                label: Some("Morphological".to_string()),
                description: Some("Grayscale opening with a disk footprint.".to_string()),
                parameters: vec![ParameterSpec::numeric(
                    "opening_radius",
                    "Opening radius",
                    "integer",
                    Value::from(15),
                )
                .bounded(Some(0.0), Some(200.0))],
            },
            MethodSpec {
                name: BackgroundMethod::Adaptive.as_str().to_string(),
                label: Some("Adaptive".to_string()),
                description: Some("Local threshold surface over square blocks.".to_string()),
                parameters: vec![
                    ParameterSpec::numeric("block_size", "Block size", "integer", Value::from(35))
                        .bounded(Some(1.0), Some(1001.0))
                        .described("Odd block edge in pixels; even values round up."),
                    ParameterSpec::numeric("offset", "Offset", "number", Value::from(0.0)),
                    ParameterSpec {
                        name: "method".to_string(),
                        label: Some("Weighting".to_string()),
                        kind: "choice".to_string(),
                        default: Some(Value::from("gaussian")),
                        minimum: None,
                        maximum: None,
                        choices: Some(vec![Value::from("gaussian"), Value::from("mean")]),
                        description: None,
                    },
                ],
            },
        ];
        Self { methods }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(text)?;
        let mut seen = HashSet::new();
        for method in &file.background.methods {
            if method.name.parse::<BackgroundMethod>().is_err() {
                return Err(CatalogError::UnsupportedMethod(method.name.clone()));
            }
            if !seen.insert(method.name.clone()) {
                return Err(CatalogError::DuplicateMethod(method.name.clone()));
            }
        }
        Ok(Self {
            methods: file.background.methods,
        })
    }

    /// Load declarations from `path`, or the built-ins when no file is configured.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_yaml_str(&text)?;
        debug!(path = %path.display(), methods = catalog.methods.len(), "Loaded method catalog");
        Ok(catalog)
    }

    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Check `params` against the declaration of `method` and fill defaults.
    pub fn validate(&self, method: &str, params: &Map<String, Value>) -> Result<Map<String, Value>, ParameterError> {
        let spec = self
            .get(method)
            .ok_or_else(|| ParameterError::UnknownMethod(method.to_string()))?;

        let mut validated = Map::new();
        for (key, value) in params {
            let declared = spec
                .parameter(key)
                .ok_or_else(|| ParameterError::Unsupported(key.clone()))?;
            declared.check(value)?;
            validated.insert(key.clone(), value.clone());
        }

        for declared in &spec.parameters {
            if validated.contains_key(&declared.name) {
                continue;
            }
            if let Some(default) = declared.default.as_ref().filter(|d| !d.is_null()) {
                validated.insert(declared.name.clone(), default.clone());
            }
        }
        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn builtin_declares_every_method() {
        let catalog = MethodCatalog::builtin();
        for method in BackgroundMethod::ALL {
            assert!(catalog.get(method.as_str()).is_some(), "{method}");
        }
    }

    #[test]
    fn fills_defaults() {
        let catalog = MethodCatalog::builtin();
        let out = catalog.validate("adaptive", &params(json!({"block_size": 21}))).unwrap();
        assert_eq!(
            Value::Object(out),
            json!({"block_size": 21, "offset": 0.0, "method": "gaussian"})
        );
    }

    #[test]
    fn radius_zero_is_accepted() {
        let catalog = MethodCatalog::builtin();
        let out = catalog.validate("basic", &params(json!({"rolling_ball_radius": 0}))).unwrap();
        assert_eq!(out["rolling_ball_radius"], json!(0));
    }

    #[test]
    fn rejects_unknown_method_and_keys() {
        let catalog = MethodCatalog::builtin();
        let err = catalog.validate("tophat", &Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "Unknown method 'tophat'");

        let err = catalog.validate("basic", &params(json!({"sigma": 2}))).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported parameter 'sigma'");
    }

    #[test]
    fn rejects_out_of_range() {
        let catalog = MethodCatalog::builtin();
        let err = catalog.validate("polynomial", &params(json!({"order": 0}))).unwrap_err();
        assert_eq!(err.to_string(), "Parameter 'order' below minimum 1");
        let err = catalog.validate("polynomial", &params(json!({"order": 6}))).unwrap_err();
        assert_eq!(err.to_string(), "Parameter 'order' above maximum 5");
    }

    #[test]
    fn rejects_invalid_choice() {
        let catalog = MethodCatalog::builtin();
        let err = catalog.validate("adaptive", &params(json!({"method": "median"}))).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Parameter 'method' must be one of ["gaussian","mean"]"#
        );
    }

    #[test]
    fn rejects_non_numeric_value() {
        let catalog = MethodCatalog::builtin();
        let err = catalog
            .validate("basic", &params(json!({"rolling_ball_radius": "big"})))
            .unwrap_err();
        assert!(matches!(err, ParameterError::NotNumeric { .. }));
    }

    #[test]
    fn numeric_choices_compare_by_value() {
        let spec = ParameterSpec {
            choices: Some(vec![json!(1), json!(2)]),
            ..ParameterSpec::numeric("k", "k", "integer", json!(1))
        };
        assert!(spec.check(&json!(2.0)).is_ok());
        assert!(spec.check(&json!(3)).is_err());
    }

    #[test]
    fn yaml_catalog_loads() {
        let text = r#"
background:
  methods:
    - name: basic
      label: BaSiC
      parameters:
        - name: rolling_ball_radius
          default: 25
          minimum: 5
          maximum: 200
"#;
        let catalog = MethodCatalog::from_yaml_str(text).unwrap();
        assert_eq!(catalog.methods().len(), 1);
        let out = catalog.validate("basic", &Map::new()).unwrap();
        assert_eq!(out["rolling_ball_radius"], json!(25));
        assert!(catalog.validate("polynomial", &Map::new()).is_err());
    }

    #[test]
    fn yaml_catalog_rejects_unregistered_method() {
        let text = "background:\n  methods:\n    - name: tophat\n";
        assert!(matches!(
            MethodCatalog::from_yaml_str(text),
            Err(CatalogError::UnsupportedMethod(name)) if name == "tophat"
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preprocessing.yaml");
        fs::write(&path, "background:\n  methods:\n    - name: morphological\n").unwrap();
        let catalog = MethodCatalog::load(Some(&path)).unwrap();
        assert!(catalog.get("morphological").is_some());
        assert_eq!(MethodCatalog::load(None).unwrap(), MethodCatalog::builtin());
        assert!(matches!(
            MethodCatalog::load(Some(&dir.path().join("missing.yaml"))),
            Err(CatalogError::Io { .. })
        ));
    }
}
