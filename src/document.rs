// SPDX-License-Identifier: AGPL-3.0-or-later

//! The two text panes of a pad session.
//!
//! `local` is only ever written by local edit commands, `remote` only by
//! inbound messages. With exactly one writer per buffer, no locking is
//! needed; the session actor owns the whole document.

#[derive(Debug, Default)]
pub struct PadDocument {
    local: String,
    remote: String,
}

impl PadDocument {
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Replaces the local buffer with the full current content of the
    /// editable pane.
    pub fn set_local(&mut self, content: String) {
        self.local = content;
    }

    pub fn clear_local(&mut self) {
        self.local.clear();
    }

    /// Applies an inbound full sync: the mirror becomes byte-identical to
    /// what the peer sent.
    pub fn replace_remote(&mut self, content: String) {
        self.remote = content;
    }

    /// Applies an inbound text message by appending to the mirror.
    pub fn append_remote(&mut self, content: &str) {
        self.remote.push_str(content);
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }
}
