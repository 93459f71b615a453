use std::{fs, path::Path};

use base64::{engine::general_purpose, Engine as _};

use crate::{materialize::SENTINEL_PREFIX, scratch::ScratchFile};

const PNG_MEDIA_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    bytes: Vec<u8>,
    media_type: &'static str,
}

impl RenderedImage {
    pub fn png(bytes: Vec<u8>) -> Self {
        RenderedImage {
            bytes,
            media_type: PNG_MEDIA_TYPE,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> &'static str {
        self.media_type
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.media_type,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

#[derive(Debug)]
pub struct Extracted {
    pub stdout: String,
    pub image: Option<RenderedImage>,
}

/// Strips sentinel lines from `stdout` and loads the image they announce.
///
/// Only `expected` is ever read. A marker naming some other path is dropped
/// from the output but otherwise ignored.
pub fn extract(stdout: String, expected: Option<&ScratchFile>) -> Extracted {
    if !stdout.contains(SENTINEL_PREFIX) {
        return Extracted {
            stdout,
            image: None,
        };
    }

    let mut visible = String::with_capacity(stdout.len());
    let mut announced = None;

    for line in stdout.split_inclusive('\n') {
        // Output the program left unterminated shares the sentinel's line.
        match line.find(SENTINEL_PREFIX) {
            Some(at) => {
                visible.push_str(&line[..at]);
                announced = Some(line[at + SENTINEL_PREFIX.len()..].trim().to_string());
            }
            None => visible.push_str(line),
        }
    }

    let image = match (announced, expected) {
        (Some(path), Some(expected)) if Path::new(&path) == expected.path() => {
            load_image(expected.path())
        }
        (Some(path), _) => {
            log::warn!("Ignoring sentinel for unexpected path {}", path);
            None
        }
        (None, _) => None,
    };

    Extracted {
        stdout: visible,
        image,
    }
}

fn load_image(path: &Path) -> Option<RenderedImage> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Unable to read rendered image {}: {}", path.display(), e);
            return None;
        }
    };

    if let Err(e) = fs::remove_file(path) {
        log::warn!("Unable to remove rendered image {}: {}", path.display(), e);
    }

    if bytes.is_empty() {
        log::warn!("Rendered image {} was empty", path.display());
        return None;
    }

    Some(RenderedImage::png(bytes))
}
