//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fault definition table and severity resolution."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fault registers are four 32-bit masks (banks A..D). Each set bit is looked up
//! in a read-only [`FaultTable`] loaded once at startup; the table is shared as
//! `Arc<FaultTable>` and never locked.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, FromRepr, IntoEnumIterator};
use tracing::{error, info, warn};

use crate::error::FaultTableError;

/// One of the four fault registers reported by a module.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum FaultBank {
    A,
    B,
    C,
    D,
}

/// Ordered fault criticality.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Severity {
    #[default]
    None = 0,
    Indicator = 1,
    Controlled = 2,
    Shutdown = 3,
    Critical = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultDefinition {
    pub severity: Severity,
    pub reboot_required: bool,
    pub tag: String,
    pub description: String,
}

/// Snapshot of the four fault registers of one module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRegisters {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}

impl FaultRegisters {
    pub fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self { a, b, c, d }
    }

    pub fn get(&self, bank: FaultBank) -> u32 {
        match bank {
            FaultBank::A => self.a,
            FaultBank::B => self.b,
            FaultBank::C => self.c,
            FaultBank::D => self.d,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.a == 0 && self.b == 0 && self.c == 0 && self.d == 0
    }
}

/// Set bit positions of a register, lowest first.
fn set_bits(register: u32) -> impl Iterator<Item = u8> {
    (0u8..32).filter(move |bit| register & (1 << bit) != 0)
}

/// Maximum severity and reboot requirement over all active faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultAssessment {
    pub severity: Severity,
    pub reboot_required: bool,
}

/// Human-readable fault descriptions per bank.
pub type FaultDescriptions = BTreeMap<FaultBank, Vec<String>>;

#[derive(Debug, Default, Clone)]
pub struct FaultTable {
    entries: HashMap<(FaultBank, u8), FaultDefinition>,
}

impl FaultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bank: FaultBank, bit: u8, definition: FaultDefinition) {
        self.entries.insert((bank, bit), definition);
    }

    pub fn lookup(&self, bank: FaultBank, bit: u8) -> Option<&FaultDefinition> {
        self.entries.get(&(bank, bit))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Definitions ordered by bank then bit, for display.
    pub fn iter_sorted(&self) -> Vec<(FaultBank, u8, &FaultDefinition)> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|((bank, bit), def)| (*bank, *bit, def))
            .collect();
        rows.sort_by_key(|(bank, bit, _)| (*bank, *bit));
        rows
    }

    /// Resolve the worst severity and whether any active fault demands a reboot.
    /// Bits without a definition count as `Severity::None` / no reboot.
    pub fn resolve(&self, registers: &FaultRegisters) -> FaultAssessment {
        if registers.is_clear() {
            return FaultAssessment::default();
        }
        let mut assessment = FaultAssessment::default();
        for bank in FaultBank::iter() {
            for bit in set_bits(registers.get(bank)) {
                if let Some(definition) = self.lookup(bank, bit) {
                    assessment.severity = assessment.severity.max(definition.severity);
                    assessment.reboot_required |= definition.reboot_required;
                }
            }
        }
        assessment
    }

    /// Describe every active fault, all four banks present even when empty.
    pub fn describe(&self, registers: &FaultRegisters) -> FaultDescriptions {
        FaultBank::iter()
            .map(|bank| {
                let lines = set_bits(registers.get(bank))
                    .map(|bit| match self.lookup(bank, bit) {
                        Some(def) => format!(
                            "{bank}{bit} [{}] {}: {}",
                            def.severity, def.tag, def.description
                        ),
                        None => format!("{bank}{bit}: undefined fault"),
                    })
                    .collect();
                (bank, lines)
            })
            .collect()
    }

    /// Load a table from a `.toml` (`[[fault]]` rows) or `.csv` file. Invalid rows
    /// are skipped with a warning; the file as a whole only fails on io/parse errors.
    pub fn load(path: &Path) -> Result<Self, FaultTableError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&fs::read_to_string(path)?),
            Some("csv") => Self::from_csv_reader(fs::File::open(path)?),
            other => Err(FaultTableError::UnsupportedFormat(
                other.unwrap_or("<none>").to_owned(),
            )),
        }
    }

    /// Load the table, degrading to an empty table on failure. Every lookup then
    /// resolves to `(None, false)`; the failure is raised as an operational alarm.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(table) => {
                info!(
                    target: "h2_ems::faults",
                    path = %path.display(),
                    definitions = table.len(),
                    "fault definition table loaded"
                );
                table
            }
            Err(err) => {
                error!(
                    target: "h2_ems::faults",
                    path = %path.display(),
                    error = %err,
                    alarm = true,
                    "fault definition table failed to load; severities degrade to None"
                );
                Self::new()
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, FaultTableError> {
        #[derive(Deserialize)]
        struct Document {
            #[serde(default)]
            fault: Vec<FaultRow>,
        }
        let document: Document = toml::from_str(contents)?;
        Ok(Self::from_rows(document.fault))
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, FaultTableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let rows = reader
            .deserialize::<FaultRow>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_rows(rows))
    }

    fn from_rows(rows: Vec<FaultRow>) -> Self {
        let mut table = Self::new();
        for row in rows {
            match row.into_entry() {
                Ok((bank, bit, definition)) => table.insert(bank, bit, definition),
                Err(err) => warn!(target: "h2_ems::faults", error = %err, "skipping fault row"),
            }
        }
        table
    }
}

/// Persistent row schema: `(bank, bit) -> (severity 0..4, reboot, tag, description)`.
#[derive(Debug, Clone, Deserialize)]
struct FaultRow {
    bank: String,
    bit: u32,
    severity: u8,
    #[serde(default, alias = "reboot")]
    reboot_required: bool,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    description: String,
}

impl FaultRow {
    fn into_entry(self) -> Result<(FaultBank, u8, FaultDefinition), FaultTableError> {
        let invalid = |reason| FaultTableError::InvalidRow {
            bank: self.bank.clone(),
            bit: self.bit,
            reason,
        };
        let bank: FaultBank = self
            .bank
            .trim()
            .parse()
            .map_err(|_| invalid("bank must be one of A, B, C, D"))?;
        if self.bit > 31 {
            return Err(invalid("bit must be within 0..=31"));
        }
        let severity =
            Severity::from_repr(self.severity).ok_or_else(|| invalid("severity must be 0..=4"))?;
        Ok((
            bank,
            self.bit as u8,
            FaultDefinition {
                severity,
                reboot_required: self.reboot_required,
                tag: self.tag,
                description: self.description,
            },
        ))
    }
}
