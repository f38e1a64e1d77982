use crate::core::error::PipelineError;
use crate::core::state::{Character, Scene};
use regex::Regex;
use std::sync::LazyLock;

/// A narration language the pipeline knows how to tag, voice and name files for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
    pub native_name: &'static str,
    /// Line prefix used in scripts, without the trailing colon.
    pub tag: &'static str,
}

pub const LANGUAGES: [Language; 3] = [
    Language {
        code: "bn-BD",
        name: "Bangla",
        native_name: "বাংলা",
        tag: "BANGLA",
    },
    Language {
        code: "hi-IN",
        name: "Hindi",
        native_name: "हिन्दी",
        tag: "HINDI",
    },
    Language {
        code: "en-US",
        name: "English",
        native_name: "English",
        tag: "ENGLISH",
    },
];

/// Language whose line becomes a scene's narrator text.
pub const DEFAULT_LANGUAGE: &str = "en-US";

const NARRATOR_PLACEHOLDER: &str = "Scene Script";
const IMAGE_TAG: &str = "IMAGE:";

pub fn find_language(code: &str) -> Option<&'static Language> {
    LANGUAGES.iter().find(|l| l.code == code)
}

static REGEX_SCENE_DELIMITER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)={10,}\s*SCENE\s+\d+\s*={10,}").expect("Invalid regex")
});

static REGEX_CASTING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)Casting bible input:(.*?)Scenes:").expect("Invalid regex")
});

#[derive(Debug, Clone, Default)]
pub struct ParsedScript {
    pub characters: Vec<Character>,
    pub scenes: Vec<Scene>,
}

/// Parses a structured script into its character bible and scenes.
///
/// Fails with [`PipelineError::NoScenesFound`] when no scene block carries an
/// image prompt or a tagged narration line.
pub fn parse(raw: &str) -> Result<ParsedScript, PipelineError> {
    let characters = parse_characters(raw);

    let mut scenes = Vec::new();
    // Anything before the first delimiter is preamble.
    for block in REGEX_SCENE_DELIMITER.split(raw).skip(1) {
        if let Some(mut scene) = parse_scene_block(block) {
            scene.id = scenes.len();
            scenes.push(scene);
        }
    }

    if scenes.is_empty() {
        return Err(PipelineError::NoScenesFound);
    }

    Ok(ParsedScript { characters, scenes })
}

fn parse_characters(raw: &str) -> Vec<Character> {
    let Some(block) = REGEX_CASTING_BLOCK.captures(raw).and_then(|c| c.get(1)) else {
        return Vec::new();
    };

    block
        .as_str()
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix('-'))
        .filter_map(|bullet| {
            let (name, description) = bullet.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Character {
                name: name.to_string(),
                description: description.trim().to_string(),
            })
        })
        .collect()
}

/// Returns the remainder of `line` if it starts with `prefix`, ignoring ASCII case.
fn strip_tag<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn parse_scene_block(block: &str) -> Option<Scene> {
    let mut scene = Scene::new(0);
    let mut first_language: Option<&'static str> = None;

    for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(prompt) = strip_tag(line, IMAGE_TAG) {
            scene.image_prompt = prompt.trim().to_string();
            continue;
        }

        for lang in LANGUAGES.iter() {
            let Some(rest) = strip_tag(line, lang.tag) else {
                continue;
            };
            let Some(text) = rest.strip_prefix(':') else {
                continue;
            };
            scene
                .translations
                .insert(lang.code.to_string(), text.trim().to_string());
            first_language.get_or_insert(lang.code);
            break;
        }
    }

    if scene.image_prompt.is_empty() && scene.translations.is_empty() {
        return None;
    }

    scene.narrator_text = scene
        .translations
        .get(DEFAULT_LANGUAGE)
        .or_else(|| first_language.and_then(|code| scene.translations.get(code)))
        .cloned()
        .unwrap_or_else(|| NARRATOR_PLACEHOLDER.to_string());

    Some(scene)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HERO_SCRIPT: &str = "Casting bible input:
- Hero: brave knight, silver armor

Scenes:
==========
SCENE 1
==========
IMAGE: a knight on a hill, vertical 9:16
ENGLISH: The knight waits.
HINDI: शूरवीर प्रतीक्षा करता है।
";

    #[test]
    fn test_hero_example() {
        let parsed = parse(HERO_SCRIPT).unwrap();

        assert_eq!(
            parsed.characters,
            vec![Character {
                name: "Hero".to_string(),
                description: "brave knight, silver armor".to_string(),
            }]
        );
        assert_eq!(parsed.scenes.len(), 1);

        let scene = &parsed.scenes[0];
        assert_eq!(scene.id, 0);
        assert_eq!(scene.image_prompt, "a knight on a hill, vertical 9:16");
        assert_eq!(scene.narrator_text, "The knight waits.");
        assert_eq!(scene.translations["en-US"], "The knight waits.");
        assert_eq!(scene.translations["hi-IN"], "शूरवीर प्रतीक्षा करता है।");
        assert!(scene.aspect_ratio().is_vertical());
    }

    #[test]
    fn test_delimiter_needs_ten_equals_each_side() {
        let nine = "========= SCENE 1 =========\nIMAGE: a\n========= SCENE 2 =========\nIMAGE: b\n";
        assert!(matches!(parse(nine), Err(PipelineError::NoScenesFound)));

        let mixed = "========== SCENE 1 ==========
IMAGE: a
========= SCENE 2 ==========
IMAGE: b
";
        // The short line stays inside scene 1, where the later IMAGE tag wins.
        let parsed = parse(mixed).unwrap();
        assert_eq!(parsed.scenes.len(), 1);
        assert_eq!(parsed.scenes[0].image_prompt, "b");
    }

    #[test]
    fn test_blocks_without_content_are_dropped() {
        let raw = "preamble IMAGE: ignored
============ SCENE 1 ============
IMAGE: first
============ SCENE 2 ============
just some notes
============ SCENE 3 ============
BANGLA: তৃতীয়
";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.scenes.len(), 2);
        assert_eq!(parsed.scenes[0].id, 0);
        assert_eq!(parsed.scenes[0].image_prompt, "first");
        assert_eq!(parsed.scenes[0].narrator_text, "Scene Script");
        assert_eq!(parsed.scenes[1].id, 1);
        assert_eq!(parsed.scenes[1].narrator_text, "তৃতীয়");
        assert!(parsed.characters.is_empty());
    }

    #[test]
    fn test_narrator_falls_back_to_first_translation_seen() {
        let raw = "==========SCENE 7==========
hindi: पहला
bangla: দ্বিতীয়
";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.scenes[0].narrator_text, "पहला");
    }

    #[test]
    fn test_no_scenes_is_an_error() {
        let err = parse("Casting bible input:\n- A: b\nScenes:\nnothing here").unwrap_err();
        assert!(matches!(err, PipelineError::NoScenesFound));
        assert_eq!(
            err.to_string(),
            "Could not find any scenes. Ensure SCENE 1 headers are present."
        );

        // A delimiter with only empty blocks still yields nothing.
        assert!(parse("========== SCENE 1 ==========\n\n").is_err());
    }

    #[test]
    fn test_malformed_character_bullets_are_skipped() {
        let raw = "CASTING BIBLE INPUT:
- Narrator without colon
-   : no name
not a bullet: ignored
- Mage: robes: blue, staff
scenes:
========== scene 1 ==========
IMAGE: tower
";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.characters.len(), 1);
        assert_eq!(parsed.characters[0].name, "Mage");
        assert_eq!(parsed.characters[0].description, "robes: blue, staff");
    }

    #[test]
    fn test_scene_order_is_preserved() {
        let raw = (1..=4)
            .map(|i| format!("==========\nSCENE {}\n==========\nIMAGE: shot {}\n", i, i))
            .collect::<String>();
        let parsed = parse(&raw).unwrap();
        let prompts: Vec<_> = parsed.scenes.iter().map(|s| s.image_prompt.as_str()).collect();
        assert_eq!(prompts, vec!["shot 1", "shot 2", "shot 3", "shot 4"]);
    }

    #[test]
    fn test_strip_tag_handles_multibyte_lines() {
        assert_eq!(strip_tag("বাংলা text", "IMAGE:"), None);
        assert_eq!(strip_tag("image: x", "IMAGE:"), Some(" x"));
    }

    #[test]
    fn test_language_table() {
        assert_eq!(find_language("hi-IN").map(|l| l.name), Some("Hindi"));
        assert!(find_language("fr-FR").is_none());
        assert!(find_language(DEFAULT_LANGUAGE).is_some());
    }
}
