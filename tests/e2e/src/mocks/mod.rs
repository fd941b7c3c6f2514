mod roster;

pub use embeddings::ScriptedEmbeddingProvider;
pub use fixtures::mention_input;
pub use roster::{stub_debater_output, RosterBuilder, ScriptedRoster};
