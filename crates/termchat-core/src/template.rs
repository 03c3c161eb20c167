//! Chat templates: how role-tagged turns are laid out in a prompt string.

use serde::{Deserialize, Serialize};

use crate::Role;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatTemplate {
    /// `<|im_start|>role\n...<|im_end|>\n` (Qwen, OpenHermes, Yi).
    #[default]
    #[serde(rename = "chatml")]
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>\n\n...<|eot_id|>`.
    #[serde(rename = "llama3")]
    Llama3,
}

impl ChatTemplate {
    /// Writes the opening marker of a turn.
    pub fn open_turn(self, out: &mut String, role: Role) {
        match self {
            ChatTemplate::ChatMl => {
                out.push_str("<|im_start|>");
                out.push_str(role.template_name());
                out.push('\n');
            }
            ChatTemplate::Llama3 => {
                out.push_str("<|start_header_id|>");
                out.push_str(role.template_name());
                out.push_str("<|end_header_id|>\n\n");
            }
        }
    }

    pub fn close_turn(self, out: &mut String) {
        match self {
            ChatTemplate::ChatMl => out.push_str("<|im_end|>\n"),
            ChatTemplate::Llama3 => out.push_str("<|eot_id|>"),
        }
    }

    /// Writes a complete turn.
    pub fn push_turn(self, out: &mut String, role: Role, content: &str) {
        self.open_turn(out, role);
        out.push_str(content);
        self.close_turn(out);
    }

    /// Control-marker substrings that must never reach a transcript.
    ///
    /// Partial markers are listed too: runtimes often split a marker over
    /// several tokens.
    pub fn default_stop_markers(self) -> Vec<String> {
        let markers: &[&str] = match self {
            ChatTemplate::ChatMl => &["<|", "|>", "im_end", "im_start", "endoftext"],
            ChatTemplate::Llama3 => &["<|", "|>", "eot_id", "header_id", "end_of_text"],
        };
        markers.iter().map(|m| m.to_string()).collect()
    }
}
