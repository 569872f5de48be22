// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::frames::cotp::TsapProfile;

/// CPU family of the target PLC.
///
/// The family selects the TSAP profiles attempted during the ISO handshake
/// and a reasonable upper bound on the PDU length requested at CommSetup.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    #[serde(rename = "S7-200", alias = "s7-200", alias = "S7200", alias = "s7200")]
    S7_200,
    #[serde(rename = "S7-300", alias = "s7-300", alias = "S7300", alias = "s7300")]
    S7_300,
    #[serde(rename = "S7-400", alias = "s7-400", alias = "S7400", alias = "s7400")]
    S7_400,
    #[serde(
        rename = "S7-1200",
        alias = "s7-1200",
        alias = "S71200",
        alias = "s71200"
    )]
    S7_1200,
    #[serde(
        rename = "S7-1500",
        alias = "s7-1500",
        alias = "S71500",
        alias = "s71500"
    )]
    S7_1500,
    #[serde(rename = "LOGO", alias = "logo", alias = "Logo0BA8", alias = "LOGO!0BA8")]
    Logo0BA8,
}

impl CpuType {
    /// PDU length requested at CommSetup; the PLC may announce less.
    pub fn optimal_pdu_length(self) -> u16 {
        match self {
            CpuType::Logo0BA8 => 240,
            CpuType::S7_200 | CpuType::S7_300 => 480,
            CpuType::S7_400 | CpuType::S7_1200 => 960,
            CpuType::S7_1500 => 1440,
        }
    }

    /// TSAP profiles to attempt, in order, each with a fresh socket.
    pub fn profile_sequence(self) -> &'static [TsapProfile] {
        match self {
            CpuType::S7_200 => &[TsapProfile::S7_200],
            CpuType::Logo0BA8 => &[TsapProfile::Logo],
            _ => &[TsapProfile::Pg, TsapProfile::Op, TsapProfile::PgAlt],
        }
    }
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuType::S7_200 => "S7-200",
            CpuType::S7_300 => "S7-300",
            CpuType::S7_400 => "S7-400",
            CpuType::S7_1200 => "S7-1200",
            CpuType::S7_1500 => "S7-1500",
            CpuType::Logo0BA8 => "LOGO",
        })
    }
}
