use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};

use crate::config::{self, AppConfig, CliOverrides};
use crate::filetree::{FileInfo, FileTree};
use crate::inspector::docker_archive::{self, ArchiveResolver};
use crate::inspector::engine::{CliEngine, EngineResolver, Strategy};
use crate::inspector::{ResolvedImage, Resolver};
use crate::progress::Spinner;

pub async fn run(image: &str, json: Option<&str>, overrides: CliOverrides) -> Result<()> {
    config::init_from_cli(overrides)?;
    let cfg = config::get();

    let resolver = resolver_for(image, cfg);
    print_source_summary(image, cfg);

    let spinner = Spinner::new(format!("Resolving {image} ..."));
    let resolved = match resolver.fetch(image).await {
        Ok(resolved) => resolved,
        Err(e) => {
            spinner.fail(format!("Failed to resolve {image}"));
            return Err(e.into());
        }
    };
    spinner.finish(format!(
        "Resolved {} layers ({})",
        resolved.layers.len(),
        format_bytes(resolved.total_size())
    ));

    match json {
        Some(dest) => write_json(&resolved, dest),
        None => print_layers(&resolved),
    }
}

fn resolver_for(image: &str, cfg: &AppConfig) -> Box<dyn Resolver> {
    if docker_archive::looks_like_archive(image) {
        return Box::new(ArchiveResolver::new(image));
    }
    Box::new(EngineResolver::new(
        Arc::new(CliEngine::new(cfg.engine.clone())),
        cfg.strategy,
        cfg.relay.clone(),
        cfg.max_parallel_layers,
    ))
}

fn print_source_summary(image: &str, cfg: &AppConfig) {
    if docker_archive::looks_like_archive(image) {
        eprintln!("{} {}", "Archive".dim(), style::style(image).cyan());
        return;
    }

    let via = match cfg.strategy {
        Strategy::Save => "save".to_string(),
        Strategy::Relay => format!("relay via {}", cfg.relay.tool.display()),
    };
    eprintln!(
        "{} {} ({})",
        "Engine".dim(),
        style::style(&cfg.engine).green().bold(),
        style::style(via).dim(),
    );
}

fn write_json(resolved: &ResolvedImage, dest: &str) -> Result<()> {
    let output = serde_json::to_string_pretty(&resolved.summary())?;
    if dest == "-" {
        println!("{output}");
    } else {
        fs::write(dest, &output).with_context(|| format!("Failed to write JSON to {dest}"))?;
        eprintln!("{} Wrote {dest}", "✔".green());
    }
    Ok(())
}

fn print_layers(resolved: &ResolvedImage) -> Result<()> {
    let mut out = io::stdout().lock();
    if !resolved.repo_tags.is_empty() {
        writeln!(out, "tags: {}", resolved.repo_tags.join(", "))?;
    }
    if let Some(digest) = &resolved.manifest_digest {
        match &resolved.media_type {
            Some(media_type) => writeln!(out, "manifest: {digest} ({media_type})")?,
            None => writeln!(out, "manifest: {digest}")?,
        }
    }
    writeln!(out, "total size: {}", format_bytes(resolved.total_size()))?;
    writeln!(out)?;

    for layer in &resolved.layers {
        writeln!(out, "#{} {}", layer.index, layer.id())?;
        writeln!(out, "  {}", layer.history.created_by)?;
        writeln!(
            out,
            "  size: {}, entries: {}",
            format_bytes(layer.history.size),
            layer.tree.len()
        )?;
        let top = top_level(&layer.tree);
        if !top.is_empty() {
            writeln!(out, "  paths: {top}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Names directly under the layer root, directories suffixed with `/`.
fn top_level(tree: &FileTree) -> String {
    let Some(root) = tree.get("") else {
        return String::new();
    };
    root.children
        .iter()
        .map(|(name, node)| {
            let is_dir =
                !node.children.is_empty() || node.info.as_ref().is_some_and(FileInfo::is_dir);
            if is_dir { format!("{name}/") } else { name.clone() }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return if size.fract() < 0.05 {
                format!("{:.0} {unit}", size)
            } else {
                format!("{:.1} {unit}", size)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filetree::EntryKind;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
    }

    fn info(path: &str, kind: EntryKind) -> FileInfo {
        FileInfo {
            path: path.into(),
            kind,
            size: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
            link_name: None,
        }
    }

    #[test]
    fn test_top_level() {
        let mut tree = FileTree::new("layer");
        tree.add_path("usr/bin/env", info("usr/bin/env", EntryKind::File)).unwrap();
        tree.add_path("tmp", info("tmp", EntryKind::Dir)).unwrap();
        tree.add_path("hello", info("hello", EntryKind::File)).unwrap();
        assert_eq!(top_level(&tree), "hello tmp/ usr/");
        assert_eq!(top_level(&FileTree::new("empty")), "");
    }
}
