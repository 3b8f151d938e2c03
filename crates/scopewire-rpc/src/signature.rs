use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One declared parameter of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Parameter list of a command, checked on both ends of the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub params: Vec<Param>,
    /// Extra positional arguments are accepted.
    #[serde(default)]
    pub varargs: bool,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            required: true,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.params.push(Param {
            name: name.into(),
            required: false,
            default: Some(default.into()),
        });
        self
    }

    pub fn with_varargs(mut self) -> Self {
        self.varargs = true;
        self
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Check that `args`/`kwargs` can be bound to this signature.
    pub fn bind(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), String> {
        if args.len() > self.params.len() && !self.varargs {
            return Err(format!(
                "takes at most {} positional arguments but {} were given",
                self.params.len(),
                args.len()
            ));
        }
        for name in kwargs.keys() {
            match self.position(name) {
                None => return Err(format!("unexpected keyword argument '{name}'")),
                Some(index) if index < args.len() => {
                    return Err(format!("argument '{name}' given twice"));
                }
                Some(_) => {}
            }
        }
        for (index, param) in self.params.iter().enumerate() {
            if param.required && index >= args.len() && !kwargs.contains_key(&param.name) {
                return Err(format!("missing required argument '{}'", param.name));
            }
        }
        Ok(())
    }

    /// Render as `name, name=default, *args` for listings.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) if !p.required => format!("{}={default}", p.name),
                _ => p.name.clone(),
            })
            .collect();
        if self.varargs {
            parts.push("*args".to_string());
        }
        parts.join(", ")
    }
}
