// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{config::get_num_cpus, errors::WorkersParseError};
use serde::Deserialize;
use std::{cmp::Ordering, fmt, str::FromStr};

/// Type for the workers config key: the number of worker slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Workers {
    /// Run a specified number of workers.
    Count(usize),

    /// Run as many workers as there are logical CPUs.
    NumCpus,
}

impl Workers {
    /// Gets the actual number of workers computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(workers) => workers,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

impl FromStr for Workers {
    type Err = WorkersParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        match s.parse::<isize>() {
            Err(_) | Ok(0) => Err(WorkersParseError::new(s)),
            Ok(j) if j < 0 => Ok(Workers::Count((get_num_cpus() as isize + j).max(1) as usize)),
            Ok(j) => Ok(Workers::Count(j as usize)),
        }
    }
}

impl<'de> Deserialize<'de> for Workers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Workers;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "an integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Workers::from_str(v).map_err(serde::de::Error::custom)
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => Ok(Workers::Count(v as usize)),
                    Ordering::Less => Ok(Workers::Count(
                        (get_num_cpus() as i64 + v).max(1) as usize,
                    )),
                    Ordering::Equal => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_i64(v as i64)
            }
        }

        deserializer.deserialize_any(V)
    }
}
