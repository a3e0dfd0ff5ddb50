//! Inline LoRA tag extraction.
//!
//! Prompts reference LoRA adapters with `<lora:name:weight>` (high-noise
//! expert variant: `<lora:|high_noise|name:weight>`). The tags are stripped
//! before the prompt reaches the backend and resolved against the LoRA
//! directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

const LORA_EXTENSIONS: &[&str] = &["safetensors", "gguf", "ckpt", "pt", "pth"];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLora {
    pub path: PathBuf,
    pub multiplier: f32,
    pub is_high_noise: bool,
}

fn lora_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<lora:(\|high_noise\|)?([^:><]+):([0-9eE.+-]+)>").expect("valid lora pattern")
    })
}

/// Extract LoRA tags from `prompt`, returning the cleaned prompt and the
/// resolved adapters. Tags whose file cannot be found under `lora_dir` are
/// dropped with a warning rather than failing the job.
pub fn parse_loras_from_prompt(prompt: &str, lora_dir: &Path) -> (String, Vec<ParsedLora>) {
    let mut loras = Vec::new();

    let cleaned = lora_regex().replace_all(prompt, |caps: &regex::Captures<'_>| {
        let is_high_noise = caps.get(1).is_some();
        let name = caps[2].trim();
        let multiplier: f32 = caps[3].parse().unwrap_or(1.0);

        match resolve_lora_file(lora_dir, name) {
            Some(path) => loras.push(ParsedLora {
                path,
                multiplier,
                is_high_noise,
            }),
            None => tracing::warn!(
                lora = name,
                dir = %lora_dir.display(),
                "lora referenced in prompt not found; tag ignored"
            ),
        }
        ""
    });

    // Collapse whitespace runs left behind by removed tags.
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    (cleaned, loras)
}

fn resolve_lora_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = dir.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    for ext in LORA_EXTENSIONS {
        let candidate = dir.join(format!("{name}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("detail.safetensors"), b"x").unwrap();

        let (clean, loras) =
            parse_loras_from_prompt("a castle <lora:detail:0.8> at dusk", dir.path());
        assert_eq!(clean, "a castle at dusk");
        assert_eq!(loras.len(), 1);
        assert_eq!(loras[0].multiplier, 0.8);
        assert!(!loras[0].is_high_noise);
        assert!(loras[0].path.ends_with("detail.safetensors"));
    }

    #[test]
    fn high_noise_variant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boost.gguf"), b"x").unwrap();

        let (clean, loras) =
            parse_loras_from_prompt("<lora:|high_noise|boost:1.2> waves", dir.path());
        assert_eq!(clean, "waves");
        assert_eq!(loras.len(), 1);
        assert!(loras[0].is_high_noise);
        assert_eq!(loras[0].multiplier, 1.2);
    }

    #[test]
    fn missing_file_drops_tag_but_keeps_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (clean, loras) = parse_loras_from_prompt("x <lora:nope:1.0> y", dir.path());
        assert_eq!(clean, "x y");
        assert!(loras.is_empty());
    }
}
