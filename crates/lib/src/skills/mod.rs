//! Skills: capability documents (SKILL.md) describing which REST endpoints the agent may read or write.
//!
//! Skills load from the config directory's skills root and any `skills.extraDirs`. Precedence: extra overwrites by name.

mod loader;

pub use loader::{load_skills, summarize_skills, Skill};
