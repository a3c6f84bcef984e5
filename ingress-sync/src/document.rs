//! Section model of the proxy configuration file.
//!
//! The file is a sequence of sections: an unindented header line
//! (`global`, `defaults`, `frontend http`, `backend web`) followed by its
//! indented body lines. Lines before the first header form the preamble.
//! Comments and blank lines are kept where they were so an untouched
//! document renders back byte-for-byte (modulo indentation of body lines).

use std::fmt;

const INDENT: &str = "    ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub header: String,
    /// Body lines without their indentation; blank lines are empty strings.
    pub lines: Vec<String>,
}

impl Section {
    pub fn new(header: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            header: header.into(),
            lines,
        }
    }

    /// First keyword of the header (`backend` for `backend web`).
    pub fn kind(&self) -> &str {
        self.header.split_whitespace().next().unwrap_or_default()
    }

    /// Header argument (`web` for `backend web`).
    pub fn name(&self) -> Option<&str> {
        self.header.split_whitespace().nth(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    preamble: Vec<String>,
    sections: Vec<Section>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = ConfigDocument::default();
        for raw in text.lines() {
            let line = raw.trim_end();
            let indented = line.starts_with(' ') || line.starts_with('\t');
            let is_header = !indented && !line.is_empty() && !line.starts_with('#');
            if is_header {
                doc.sections.push(Section::new(line, Vec::new()));
                continue;
            }
            match doc.sections.last_mut() {
                Some(section) => section.lines.push(line.trim_start().to_string()),
                None => doc.preamble.push(line.to_string()),
            }
        }
        doc
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, header: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.header == header)
    }

    /// Insert or replace the section named `header`. Returns `true` when the
    /// document changed.
    pub fn set_section(&mut self, header: &str, lines: Vec<String>) -> bool {
        match self.sections.iter_mut().find(|s| s.header == header) {
            Some(existing) if existing.lines == lines => false,
            Some(existing) => {
                existing.lines = lines;
                true
            }
            None => {
                self.sections.push(Section::new(header, lines));
                true
            }
        }
    }

    pub fn remove_section(&mut self, header: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.header != header);
        self.sections.len() != before
    }

    /// Drop every section for which `keep` returns `false`; returns the removed
    /// headers.
    pub fn retain_sections(&mut self, mut keep: impl FnMut(&Section) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.sections.retain(|s| {
            let kept = keep(s);
            if !kept {
                removed.push(s.header.clone());
            }
            kept
        });
        removed
    }

    /// Set (`Some`) or remove (`None`) the single directive `keyword` inside
    /// `header`, creating the section when a value is set. Returns `true` when
    /// the document changed.
    pub fn set_directive(&mut self, header: &str, keyword: &str, value: Option<&str>) -> bool {
        let wanted = value.map(|v| format!("{keyword} {v}"));
        let Some(section) = self.sections.iter_mut().find(|s| s.header == header) else {
            return match wanted {
                Some(line) => {
                    self.sections.push(Section::new(header, vec![line]));
                    true
                }
                None => false,
            };
        };

        let matches_keyword =
            |line: &String| line.split_whitespace().next() == Some(keyword);
        let current: Vec<&String> = section.lines.iter().filter(|&l| matches_keyword(l)).collect();
        if let Some(line) = &wanted {
            if current.len() == 1 && current[0] == line {
                return false;
            }
        } else if current.is_empty() {
            return false;
        }

        let position = section.lines.iter().position(matches_keyword);
        section.lines.retain(|l| !matches_keyword(l));
        if let Some(line) = wanted {
            let at = position.unwrap_or(section.lines.len()).min(section.lines.len());
            section.lines.insert(at, line);
        }
        true
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.preamble {
            writeln!(f, "{line}")?;
        }
        for section in &self.sections {
            writeln!(f, "{}", section.header)?;
            for line in &section.lines {
                if line.is_empty() {
                    writeln!(f)?;
                } else {
                    writeln!(f, "{INDENT}{line}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "\
# managed by the ingress controller
global
    daemon
    maxconn 1000

defaults
    mode http
    # keep
    timeout client 30s

frontend http
    bind *:80
    use_backend %[base,map_beg(/etc/haproxy/maps/hosts.map,default)]
";

    #[test]
    fn parse_and_render_round_trips_canonical_text() {
        let doc = ConfigDocument::parse(BASE);
        assert_eq!(doc.sections().len(), 3);
        assert_eq!(doc.render(), BASE);
    }

    #[test]
    fn section_kind_and_name() {
        let doc = ConfigDocument::parse(BASE);
        let frontend = doc.section("frontend http").unwrap();
        assert_eq!(frontend.kind(), "frontend");
        assert_eq!(frontend.name(), Some("http"));
        assert_eq!(doc.section("global").unwrap().name(), None);
    }

    #[test]
    fn set_section_reports_change_only_when_content_differs() {
        let mut doc = ConfigDocument::parse(BASE);
        let lines = vec!["server s1 10.0.0.1:80".to_string()];
        assert!(doc.set_section("backend web", lines.clone()));
        assert!(!doc.set_section("backend web", lines));
        assert!(doc.render().ends_with("backend web\n    server s1 10.0.0.1:80\n"));
        assert!(doc.remove_section("backend web"));
        assert!(!doc.remove_section("backend web"));
    }

    #[test]
    fn set_directive_replaces_in_place() {
        let mut doc = ConfigDocument::parse(BASE);
        assert!(doc.set_directive("global", "maxconn", Some("2000")));
        assert!(!doc.set_directive("global", "maxconn", Some("2000")));
        assert_eq!(
            doc.section("global").unwrap().lines,
            vec!["daemon", "maxconn 2000", ""]
        );

        assert!(doc.set_directive("global", "maxconn", None));
        assert!(!doc.set_directive("global", "maxconn", None));
        assert!(doc.set_directive("global", "nbthread", Some("4")));
        assert_eq!(
            doc.section("global").unwrap().lines,
            vec!["daemon", "", "nbthread 4"]
        );
    }

    #[test]
    fn retain_sections_lists_removed_headers() {
        let mut doc = ConfigDocument::parse(BASE);
        doc.set_section("backend ing-a", vec![]);
        doc.set_section("backend ing-b", vec![]);
        let removed = doc.retain_sections(|s| s.header != "backend ing-a");
        assert_eq!(removed, vec!["backend ing-a"]);
        assert!(doc.section("backend ing-b").is_some());
    }
}
