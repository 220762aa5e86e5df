// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod config;
pub mod connection;
pub mod document;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod syncthing;
