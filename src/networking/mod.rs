// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod protocol;
pub mod session;

pub use protocol::BlockInfo;
pub use session::{ConnectionType, PeerSession, PeerSessionParameters, SessionState, SessionTimeouts};
