//! Human-readable artifact writers for the persisted layout: `Chapters.md`,
//! `Elements.md`, `Contents.md`. `Chapters.md`'s format is a
//! stable contract the regenerate-specific-scene code path parses.

use std::path::Path;

use crate::atomic;
use crate::model::{ChapterDescriptor, Entity, Scene};

/// `### Chapter N: <title>` / `#### Scene K` / fenced json block / `---`.
pub fn render_chapters_md(chapters: &[ChapterDescriptor], scenes_by_chapter: &[(u32, Vec<Scene>)]) -> String {
    let mut out = String::new();
    for chapter in chapters {
        out.push_str(&format!("### Chapter {}: {}\n\n", chapter.number, chapter.title));
        if let Some((_, scenes)) = scenes_by_chapter.iter().find(|(n, _)| *n == chapter.number) {
            for scene in scenes {
                out.push_str(&format!("#### Scene {}\n\n", scene.index));
                out.push_str("```json\n");
                out.push_str(&serde_json::to_string_pretty(scene).unwrap_or_default());
                out.push_str("\n```\n\n---\n\n");
            }
        }
    }
    out
}

pub fn render_elements_md(entities: &[Entity]) -> String {
    let mut out = String::from("# Elements\n\n");
    for entity in entities {
        out.push_str(&format!("## {} ({:?})\n\n{}\n\n", entity.name, entity.entity_type, entity.description));
        if !entity.aliases.is_empty() {
            out.push_str(&format!("Aliases: {}\n\n", entity.aliases.join(", ")));
        }
        out.push_str(&format!(
            "Appearances: chapters {}\n\n---\n\n",
            entity
                .appearances
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    out
}

pub fn render_contents_md(book_title: &str, chapter_count: usize, scene_count: usize, entity_count: usize) -> String {
    format!(
        "# {book_title}\n\n- Chapters: {chapter_count}\n- Scenes: {scene_count}\n- Entities: {entity_count}\n\nSee Chapters.md and Elements.md for the full catalog.\n"
    )
}

pub async fn write_chapters_md(output_dir: &Path, content: &str) -> anyhow::Result<()> {
    atomic::write_str(&output_dir.join("Chapters.md"), content)?;
    Ok(())
}

pub async fn write_elements_md(output_dir: &Path, content: &str) -> anyhow::Result<()> {
    atomic::write_str(&output_dir.join("Elements.md"), content)?;
    Ok(())
}

pub async fn write_contents_md(output_dir: &Path, content: &str) -> anyhow::Result<()> {
    atomic::write_str(&output_dir.join("Contents.md"), content)?;
    Ok(())
}

/// Parses `Chapters.md` back into its fenced-json scene records, for the
/// regenerate-specific-scene code path.
pub fn parse_chapters_md(content: &str) -> Vec<Scene> {
    let mut scenes = Vec::new();
    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        if line.trim() == "```json" {
            let mut block = String::new();
            for inner in lines.by_ref() {
                if inner.trim() == "```" {
                    break;
                }
                block.push_str(inner);
                block.push('\n');
            }
            if let Ok(scene) = serde_json::from_str::<Scene>(&block) {
                scenes.push(scene);
            }
        }
    }
    scenes
}
