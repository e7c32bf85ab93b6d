//! Section/key configuration file reader.
//!
//! The grammar shared by the message-filter configuration and the per-device
//! logstorage configuration: `[Section]` headers, `key = value` entries,
//! `#`/`;` comment lines. Keys are matched case-insensitively.

use std::collections::HashMap;
use std::io;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    entries: HashMap<String, String>,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ConfigFile {
    sections: Vec<Section>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> io::Result<ConfigFile> {
        Ok(ConfigFile::parse(&std::fs::read_to_string(path)?))
    }

    pub fn parse(text: &str) -> ConfigFile {
        let mut sections: Vec<Section> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push(Section {
                    name: name.trim().to_string(),
                    entries: HashMap::new(),
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if let Some(section) = sections.last_mut() {
                section
                    .entries
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        ConfigFile { sections }
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_entries() {
        let text = "# device configuration\n\
                    [General]\n\
                    BlockMode = ON\n\
                    ; a comment\n\
                    [FILTER1]\n\
                    LogAppName = APP1,APP2\n\
                    File=app_log\n";
        let cfg = ConfigFile::parse(text);
        assert_eq!(cfg.num_sections(), 2);
        let mut it = cfg.sections();
        let general = it.next().unwrap();
        assert_eq!(general.name(), "General");
        assert_eq!(general.value("blockmode"), Some("ON"));
        assert_eq!(general.value("BlockMode"), Some("ON"));
        let filter = it.next().unwrap();
        assert_eq!(filter.name(), "FILTER1");
        assert_eq!(filter.value("File"), Some("app_log"));
        assert_eq!(filter.value("NOFiles"), None);
    }

    #[test]
    fn entries_before_any_section_are_ignored() {
        let cfg = ConfigFile::parse("orphan = 1\n[A]\nkey = v\n");
        assert_eq!(cfg.num_sections(), 1);
        assert_eq!(cfg.sections().next().unwrap().value("key"), Some("v"));
    }
}
