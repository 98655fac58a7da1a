//! Loader for native-module definition files (`<name>.ld`).

use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Kind of a name exported by a native module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalDef {
    Const,
    Func,
}

/// Names exported by one native module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleDefs {
    entries: HashMap<String, ExternalDef>,
}

impl ModuleDefs {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_func(&self, name: &str) -> bool {
        self.entries.get(name) == Some(&ExternalDef::Func)
    }

    /// Parse definition text: one name per line, blank lines and `#` comments
    /// skipped. A name with a dot carries an arity suffix (`f.2`) and records
    /// a function under the part before the first dot; anything else is a
    /// constant.
    pub fn from_text(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let name = line.trim();
            if name.is_empty() || name.starts_with('#') {
                continue;
            }
            match name.split_once('.') {
                Some((func_name, _arity)) => {
                    entries.insert(func_name.to_string(), ExternalDef::Func);
                }
                None => {
                    entries.insert(name.to_string(), ExternalDef::Const);
                }
            }
        }
        Self { entries }
    }

    /// Load `<defs_dir>/<module>.ld`.
    pub fn load(defs_dir: &Path, module: &str) -> io::Result<Self> {
        let path = defs_dir.join(format!("{module}.ld"));
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_text(&text))
    }
}
