use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{
    language::Language,
    scratch::{self, ScratchFile},
    Error, Result,
};

/// Printed on its own line by redirected Python code once a figure is saved.
pub const SENTINEL_PREFIX: &str = "GRAPH_SAVED:";

const MAX_NAME_ATTEMPTS: usize = 16;

/// Decides whether a piece of source wants its graphical output captured.
pub trait RenderDetector: Send + Sync {
    fn needs_render_redirect(&self, code: &str) -> bool;
}

/// Substring matching on the usual matplotlib spellings.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlotHeuristic;

impl RenderDetector for PlotHeuristic {
    fn needs_render_redirect(&self, code: &str) -> bool {
        code.contains("matplotlib") || code.contains("plt.show(") || code.contains("plt.plot(")
    }
}

#[derive(Debug)]
pub struct Materialized {
    pub source: ScratchFile,
    pub image: Option<ScratchFile>,
}

pub struct Materializer {
    dir: PathBuf,
    detector: Box<dyn RenderDetector>,
}

impl Materializer {
    pub fn new(dir: PathBuf, detector: Box<dyn RenderDetector>) -> Self {
        Materializer { dir, detector }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn materialize(&self, language: Language, code: &str) -> Result<Materialized> {
        let redirect =
            language.supports_render_redirect() && self.detector.needs_render_redirect(code);

        if !redirect {
            let source = self.write_new("temp", language.file_extension(), code)?;
            return Ok(Materialized {
                source,
                image: None,
            });
        }

        let image = ScratchFile::new(
            self.dir
                .join(format!("{}.png", scratch::unique_stem("graph"))),
        );
        let wrapped = redirect_python_rendering(code, image.path());
        let source = self.write_new("temp", language.file_extension(), &wrapped)?;

        log::debug!(
            "Redirecting rendered output of {} to {}",
            source.path().display(),
            image.path().display()
        );

        Ok(Materialized {
            source,
            image: Some(image),
        })
    }

    /// Writes `contents` to a fresh file, never replacing an existing one.
    pub(crate) fn write_new(&self, prefix: &str, extension: &str, contents: &str) -> Result<ScratchFile> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self
                .dir
                .join(format!("{}.{}", scratch::unique_stem(prefix), extension));

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::warn!("Scratch name {} already taken, retrying", path.display());
                    continue;
                }
                Err(e) => return Err(Error::UnableToCreateSourceFile { source: e }),
            };

            let scratch = ScratchFile::new(path);
            file.write_all(contents.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| Error::UnableToCreateSourceFile { source: e })?;

            log::debug!(
                "Wrote {} bytes of source to {}",
                contents.len(),
                scratch.path().display()
            );
            return Ok(scratch);
        }

        Err(Error::UnableToCreateSourceFile {
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "no free scratch file name",
            ),
        })
    }
}

/// Quotes `s` as a Python string literal. A JSON string is a valid one.
pub(crate) fn python_str_literal(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn render_prelude(image: &Path) -> String {
    let path = python_str_literal(&image.to_string_lossy());

    let body = format!(
        r#"try:
    import matplotlib as _sandbox_mpl
    _sandbox_mpl.use('Agg')
    import matplotlib.pyplot as _sandbox_plt
except ImportError:
    _sandbox_plt = None
else:
    def _sandbox_show(*args, **kwargs):
        if not _sandbox_plt.get_fignums():
            return
        _sandbox_plt.savefig({path}, bbox_inches='tight', dpi=150)
        _sandbox_plt.close('all')
        print({marker} + {path}, flush=True)
    _sandbox_plt.show = _sandbox_show
"#,
        path = path,
        marker = python_str_literal(SENTINEL_PREFIX),
    );

    // One physical line, so user line numbers only move by one.
    format!(
        "exec(compile({}, '<sandbox>', 'exec'))\n",
        python_str_literal(&body)
    )
}

/// Forces a non-interactive backend and turns every `show()` into
/// "save the current figure to `image` and print the sentinel".
///
/// User lines are kept verbatim. `from __future__` imports must stay the
/// first statements, so the prelude goes after them.
pub fn redirect_python_rendering(code: &str, image: &Path) -> String {
    let lines: Vec<&str> = code.split_inclusive('\n').collect();
    let split = lines
        .iter()
        .rposition(|line| line.trim_start().starts_with("from __future__ import"))
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut out = String::with_capacity(code.len() + 512);
    for line in &lines[..split] {
        out.push_str(line);
    }
    if split > 0 && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&render_prelude(image));
    for line in &lines[split..] {
        out.push_str(line);
    }
    out
}
