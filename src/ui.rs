//! Interactive credential prompts.

use std::io;

/// Asks the operator for a secret. Production code uses [TerminalPrompt]; tests
/// substitute a scripted implementation.
pub trait PromptSecrets {
    fn secret(&mut self, prompt: &str) -> io::Result<String>;
}

/// Prompts on the controlling terminal with echo disabled.
pub struct TerminalPrompt;

impl PromptSecrets for TerminalPrompt {
    fn secret(&mut self, prompt: &str) -> io::Result<String> {
        dialoguer::Password::new()
            .with_prompt(prompt)
            .interact()
            .map_err(io::Error::other)
    }
}
