//! Charts rendered from plain data series.

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;

use crate::{
    executor::Limits,
    extract::RenderedImage,
    language::Language,
    materialize::python_str_literal,
    scratch::{self, ScratchFile},
    Error, Result, Sandbox,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphKind {
    Line,
    Bar,
    Scatter,
    #[serde(other)]
    Plain,
}

impl Default for GraphKind {
    fn default() -> Self {
        GraphKind::Line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRequest {
    #[serde(default)]
    pub x_data: Vec<Value>,
    #[serde(default)]
    pub y_data: Vec<f64>,
    #[serde(default)]
    pub graph_type: GraphKind,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_xlabel")]
    pub xlabel: String,
    #[serde(default = "default_ylabel")]
    pub ylabel: String,
}

fn default_title() -> String {
    "Graph".to_string()
}

fn default_xlabel() -> String {
    "X".to_string()
}

fn default_ylabel() -> String {
    "Y".to_string()
}

const SCRIPT: &str = r#"import json
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt

spec = json.loads(SPEC)

plt.figure(figsize=(10, 6))
kind = spec['kind']
if kind == 'line':
    plt.plot(spec['x'], spec['y'], marker='o', linewidth=2)
elif kind == 'bar':
    plt.bar(spec['x'], spec['y'], color='skyblue')
elif kind == 'scatter':
    plt.scatter(spec['x'], spec['y'], s=100, alpha=0.6)
else:
    plt.plot(spec['x'], spec['y'])

plt.title(spec['title'], fontsize=16)
plt.xlabel(spec['xlabel'])
plt.ylabel(spec['ylabel'])
plt.grid(True, alpha=0.3)
plt.savefig(spec['output'], bbox_inches='tight', dpi=150)
plt.close()
print('Graph generated successfully')
"#;

impl GraphRequest {
    pub fn validate(&self) -> Result<()> {
        if self.x_data.is_empty() || self.y_data.is_empty() {
            return Err(Error::InvalidGraphRequest {
                reason: "xData and yData are required".to_string(),
            });
        }
        Ok(())
    }

    /// The Python program drawing this chart into `output`. User strings only
    /// ever reach the interpreter inside a JSON document.
    fn script(&self, output: &std::path::Path) -> String {
        let kind = match self.graph_type {
            GraphKind::Line => "line",
            GraphKind::Bar => "bar",
            GraphKind::Scatter => "scatter",
            GraphKind::Plain => "plain",
        };
        let spec = json!({
            "kind": kind,
            "x": self.x_data,
            "y": self.y_data,
            "title": self.title,
            "xlabel": self.xlabel,
            "ylabel": self.ylabel,
            "output": output.to_string_lossy(),
        });

        SCRIPT.replacen("SPEC", &python_str_literal(&spec.to_string()), 1)
    }
}

impl Sandbox {
    pub async fn render_graph(&self, req: &GraphRequest) -> Result<RenderedImage> {
        req.validate()?;

        let image = ScratchFile::new(
            self.scratch_dir()
                .join(format!("{}.png", scratch::unique_stem("graph_output"))),
        );
        let source = self
            .materializer
            .write_new("graph_gen", Language::Python.file_extension(), &req.script(image.path()))?;

        let limits = Limits {
            timeout: self.config.graph_timeout,
            output_limit: self.config.output_limit,
        };
        let output = self
            .executor
            .run_with_limits(Language::Python, source.path(), self.scratch_dir(), &limits)
            .await?;

        let rendered = if output.exit_code == Some(0) {
            fs::read(image.path()).ok().filter(|bytes| !bytes.is_empty())
        } else {
            None
        };

        drop(source);
        drop(image);

        match rendered {
            Some(bytes) => Ok(RenderedImage::png(bytes)),
            None => Err(Error::GraphRenderFailed {
                stderr: output.stderr,
            }),
        }
    }
}
