use std::{fmt, str::FromStr};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    pub fn name(self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
        }
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
        }
    }

    /// Whether graphical output can be redirected into a scratch image.
    pub fn supports_render_redirect(self) -> bool {
        match self {
            Language::Python => true,
            Language::JavaScript => false,
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Language::Python => &["python", "py"],
            Language::JavaScript => &["javascript", "js"],
        }
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();

        Language::ALL
            .iter()
            .copied()
            .find(|lang| {
                lang.aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(token))
            })
            .ok_or_else(|| Error::UnsupportedLanguage {
                language: s.to_string(),
            })
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
