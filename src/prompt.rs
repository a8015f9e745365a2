use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::log_debug;
use crate::types::story_type_prefix;

/// Separator between system-context sections.
const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Fallback story prompt used when the base prompt file is missing.
const FALLBACK_PROMPT: &str = "Work on story {{STORY_ID}} from the backlog at {{PRD_JSON_DIR}}. \
Read the story file, satisfy its acceptance criteria, and update the story JSON when done.";

/// Parameters for composing one iteration's prompts.
pub struct ComposeParams<'a> {
    pub story_id: &'a str,
    pub model: &'a str,
    pub working_dir: &'a Path,
    pub prd_dir: &'a Path,
    /// Caller-supplied extra context files.
    pub extra_contexts: &'a [PathBuf],
}

/// Output of the composer: the system context appended to the assistant's
/// system prompt, and the per-story prompt payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub system_context: String,
    pub story_prompt: String,
}

// --- Project registry ---

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProjectRegistry {
    pub projects: Vec<ProjectEntry>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub contexts: Vec<PathBuf>,
}

impl ProjectRegistry {
    /// Load the registry from a TOML file. A missing file is an empty
    /// registry; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, String> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(format!("Failed to read {}: {}", path.display(), e)),
        };
        toml::from_str(&contents).map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
    }

    /// Contexts for the entry with the longest path-prefix match on
    /// `working_dir`: exact equality, or a prefix followed by a path
    /// separator.
    pub fn contexts_for(&self, working_dir: &Path) -> &[PathBuf] {
        let dir = working_dir.to_string_lossy();
        self.projects
            .iter()
            .filter(|entry| {
                let prefix = entry.path.to_string_lossy();
                dir == prefix
                    || dir.starts_with(&format!("{}{}", prefix, std::path::MAIN_SEPARATOR))
            })
            .max_by_key(|entry| entry.path.as_os_str().len())
            .map(|entry| entry.contexts.as_slice())
            .unwrap_or(&[])
    }
}

// --- Composer ---

pub struct Composer {
    contexts_dir: PathBuf,
    prompts_dir: PathBuf,
    registry: ProjectRegistry,
}

impl Composer {
    pub fn new(contexts_dir: &Path, prompts_dir: &Path) -> Result<Self, String> {
        let registry = ProjectRegistry::load(&contexts_dir.join("registry.toml"))?;
        Ok(Self {
            contexts_dir: contexts_dir.to_path_buf(),
            prompts_dir: prompts_dir.to_path_buf(),
            registry,
        })
    }

    /// Construct with an explicit registry (tests, embedding callers).
    pub fn with_registry(
        contexts_dir: &Path,
        prompts_dir: &Path,
        registry: ProjectRegistry,
    ) -> Self {
        Self {
            contexts_dir: contexts_dir.to_path_buf(),
            prompts_dir: prompts_dir.to_path_buf(),
            registry,
        }
    }

    pub fn compose(&self, params: &ComposeParams) -> ComposedPrompt {
        ComposedPrompt {
            system_context: self.build_system_context(params),
            story_prompt: self.build_story_prompt(params),
        }
    }

    /// Assemble the layered system context: base, autonomous workflow,
    /// registry contexts for the working directory, auto-detected stack
    /// contexts, then caller extras. Deduplicated by absolute path; the
    /// first occurrence wins. Missing files are skipped.
    fn build_system_context(&self, params: &ComposeParams) -> String {
        let mut candidates: Vec<PathBuf> = vec![
            self.contexts_dir.join("base.md"),
            self.contexts_dir.join("workflow.md"),
        ];
        candidates.extend(self.registry.contexts_for(params.working_dir).iter().cloned());
        for stack in detect_stacks(params.working_dir) {
            candidates.push(self.contexts_dir.join("stacks").join(format!("{}.md", stack)));
        }
        candidates.extend(params.extra_contexts.iter().cloned());

        let mut seen = HashSet::new();
        let mut sections = Vec::new();
        for path in candidates {
            let key = path
                .canonicalize()
                .unwrap_or_else(|_| path.clone())
                .to_string_lossy()
                .into_owned();
            if !seen.insert(key) {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(contents) => sections.push(contents.trim_end().to_string()),
                Err(_) => log_debug!("[prompt] Skipping missing context {}", path.display()),
            }
        }

        sections.join(SECTION_SEPARATOR)
    }

    /// Base prompt plus the story-type-specific prompt (selected by id
    /// prefix), with placeholders substituted globally. An unknown prefix
    /// contributes nothing; a missing base prompt falls back to a minimal
    /// built-in.
    fn build_story_prompt(&self, params: &ComposeParams) -> String {
        let base = fs::read_to_string(self.prompts_dir.join("base.md"))
            .unwrap_or_else(|_| FALLBACK_PROMPT.to_string());

        let prefix = story_type_prefix(params.story_id).to_lowercase();
        let typed = fs::read_to_string(self.prompts_dir.join(format!("{}.md", prefix))).ok();

        let combined = match typed {
            Some(t) => format!("{}\n\n{}", base.trim_end(), t.trim_end()),
            None => base.trim_end().to_string(),
        };

        substitute_placeholders(&combined, params)
    }
}

fn substitute_placeholders(text: &str, params: &ComposeParams) -> String {
    text.replace("{{MODEL}}", params.model)
        .replace("{{PRD_JSON_DIR}}", &params.prd_dir.to_string_lossy())
        .replace("{{WORKING_DIR}}", &params.working_dir.to_string_lossy())
        .replace("{{ISO_TIMESTAMP}}", &chrono::Utc::now().to_rfc3339())
        .replace("{{STORY_ID}}", params.story_id)
}

// --- Stack detection ---

/// Detect tech stacks from marker files in the working directory.
/// A stack named `X` contributes `<contexts_dir>/stacks/X.md` when present.
pub fn detect_stacks(working_dir: &Path) -> Vec<&'static str> {
    let mut stacks = Vec::new();

    if working_dir.join("Cargo.toml").exists() {
        stacks.push("rust");
    }
    if working_dir.join("go.mod").exists() {
        stacks.push("go");
    }
    if working_dir.join("pyproject.toml").exists() {
        stacks.push("python");
    }
    if let Ok(manifest) = fs::read_to_string(working_dir.join("package.json")) {
        stacks.push("node");
        for (needle, stack) in [
            ("\"react\"", "react"),
            ("\"vue\"", "vue"),
            ("\"svelte\"", "svelte"),
            ("\"next\"", "next"),
        ] {
            if manifest.contains(needle) {
                stacks.push(stack);
            }
        }
    }
    if working_dir.join("tsconfig.json").exists() {
        stacks.push("typescript");
    }

    stacks
}
