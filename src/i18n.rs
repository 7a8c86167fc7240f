use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug)]
pub enum I18nError {
    Io(std::io::Error),
    Yaml(String, serde_yaml::Error),
}

impl fmt::Display for I18nError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Yaml(file, err) => write!(f, "yaml parse error in `{file}`: {err}"),
        }
    }
}

impl std::error::Error for I18nError {}

/// Translation dictionary: language → key → template. Loaded once at
/// startup and read-only afterward, except that lookups for unknown keys
/// write a diagnostic placeholder back into the dictionary. That fallback
/// cache is a debugging aid, not a consistency guarantee.
pub struct I18n {
    dict: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl I18n {
    pub fn new() -> Self {
        Self {
            dict: RwLock::new(HashMap::new()),
        }
    }

    /// Load every `<lang>.yaml` / `<lang>.yml` file under `dir` as a flat
    /// key → template map. Any unreadable or unparsable file is fatal.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, I18nError> {
        let i18n = Self::new();

        for entry in fs::read_dir(dir).map_err(I18nError::Io)? {
            let entry = entry.map_err(I18nError::Io)?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !path.is_file() || !is_yaml {
                continue;
            }

            let Some(lang) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let raw = fs::read_to_string(&path).map_err(I18nError::Io)?;
            let templates: HashMap<String, String> = serde_yaml::from_str(&raw)
                .map_err(|err| I18nError::Yaml(path.display().to_string(), err))?;

            let mut dict = i18n.dict.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            dict.insert(lang.to_string(), templates);
        }

        Ok(i18n)
    }

    pub fn insert(&self, lang: &str, key: &str, template: &str) {
        let mut dict = self
            .dict
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        dict.entry(lang.to_string())
            .or_default()
            .insert(key.to_string(), template.to_string());
    }

    /// Core lookup. Returns the template and whether it was an authoritative
    /// hit; misses on a known language are memoized as placeholders.
    fn lookup(&self, lang: &str, key: &str) -> (String, bool) {
        let placeholder = format!("Translation key '{key}' for language '{lang}' not found.");

        {
            let dict = self
                .dict
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match dict.get(lang) {
                None => return (placeholder, false),
                Some(templates) => {
                    if let Some(template) = templates.get(key)
                        && !template.is_empty()
                    {
                        return (template.clone(), true);
                    }
                }
            }
        }

        let mut dict = self
            .dict
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(templates) = dict.get_mut(lang) {
            templates.insert(key.to_string(), placeholder.clone());
        }
        (placeholder, false)
    }

    pub fn translate(&self, lang: &str, key: &str) -> String {
        self.lookup(lang, key).0
    }

    /// Translate and fill positional `{}` placeholders from `argv`.
    /// Placeholder misses come back unformatted.
    pub fn translate_format(&self, lang: &str, key: &str, argv: &[Value]) -> String {
        let (template, found) = self.lookup(lang, key);
        if !found {
            return template;
        }
        format_positional(&template, argv)
    }
}

impl Default for I18n {
    fn default() -> Self {
        Self::new()
    }
}

fn format_positional(template: &str, argv: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut args = argv.iter();

    while let Some(index) = rest.find("{}") {
        out.push_str(&rest[..index]);
        match args.next() {
            Some(value) => out.push_str(&render_value(value)),
            None => out.push_str("{}"),
        }
        rest = &rest[index + 2..];
    }

    out.push_str(rest);
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
