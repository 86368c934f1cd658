//! Persona directory - skill profiles available for team composition.
//!
//! The default directory ships embedded with the crate; deployments can load
//! a replacement from disk.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, RwLock};

use ensemble_core::{CoreError, Result};
use tracing::info;

/// One persona row from the directory.
#[derive(Debug, Clone)]
pub struct Persona {
    pub persona_id: String,
    pub display_name: String,
    pub skills: Vec<String>,
    pub suitable_roles: Vec<String>,
    pub description: String,
}

impl Persona {
    pub fn suits_role(&self, role_id: &str) -> bool {
        self.suitable_roles
            .iter()
            .any(|r| r.eq_ignore_ascii_case(role_id))
    }
}

/// In-memory persona catalog, indexed by persona id and by suitable role.
pub struct PersonaDirectory {
    personas: Arc<RwLock<HashMap<String, Persona>>>,
    by_role: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl PersonaDirectory {
    pub fn new() -> Self {
        Self {
            personas: Arc::new(RwLock::new(HashMap::new())),
            by_role: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Load the embedded default directory bundled with this crate.
    pub fn with_default_data() -> Result<Self> {
        let directory = Self::new();
        directory.load_default()?;
        Ok(directory)
    }

    pub fn load_default(&self) -> Result<usize> {
        let csv_bytes = include_bytes!("../data/persona_directory.csv");
        let cursor = Cursor::new(csv_bytes.as_ref());
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(cursor);
        self.load_from_reader(reader)
    }

    /// Load a persona directory from a CSV file on disk.
    pub fn load_from_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        info!("loading persona directory from {}", path.as_ref().display());
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|err| CoreError::Validation(format!("persona csv: {err}")))?;
        self.load_from_reader(reader)
    }

    fn load_from_reader<R: Read>(&self, mut reader: csv::Reader<R>) -> Result<usize> {
        let mut count = 0;
        let mut personas = self.personas.write().unwrap();
        for record in reader.records() {
            let record = record.map_err(|err| CoreError::Validation(format!("persona csv: {err}")))?;
            let persona = Self::parse_record(&record)?;
            if personas.insert(persona.persona_id.clone(), persona).is_none() {
                count += 1;
            }
        }
        drop(personas);
        self.rebuild_role_index();
        info!("loaded {} personas", count);
        Ok(count)
    }

    fn parse_record(record: &csv::StringRecord) -> Result<Persona> {
        let field = |idx: usize, name: &str| -> Result<String> {
            record
                .get(idx)
                .map(str::to_string)
                .ok_or_else(|| CoreError::Validation(format!("persona csv missing {name}")))
        };
        Ok(Persona {
            persona_id: field(0, "persona_id")?,
            display_name: field(1, "display_name")?,
            skills: split_list(&field(2, "skills")?),
            suitable_roles: split_list(&field(3, "suitable_roles")?),
            description: field(4, "description")?,
        })
    }

    fn rebuild_role_index(&self) {
        let personas = self.personas.read().unwrap();
        let mut by_role: HashMap<String, Vec<String>> = HashMap::new();
        for persona in personas.values() {
            for role in &persona.suitable_roles {
                by_role
                    .entry(role.to_lowercase())
                    .or_default()
                    .push(persona.persona_id.clone());
            }
        }
        for ids in by_role.values_mut() {
            ids.sort();
        }
        *self.by_role.write().unwrap() = by_role;
    }

    pub fn get(&self, persona_id: &str) -> Option<Persona> {
        self.personas.read().unwrap().get(persona_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.personas.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Personas suitable for a role, in stable order.
    pub fn for_role(&self, role_id: &str) -> Vec<Persona> {
        let by_role = self.by_role.read().unwrap();
        let personas = self.personas.read().unwrap();
        by_role
            .get(&role_id.to_lowercase())
            .map(|ids| ids.iter().filter_map(|id| personas.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// All skills across the directory, used by expertise-coverage scoring.
    pub fn all_skills(&self) -> Vec<String> {
        let personas = self.personas.read().unwrap();
        let mut skills: Vec<String> = personas
            .values()
            .flat_map(|p| p.skills.iter().cloned())
            .collect();
        skills.sort();
        skills.dedup();
        skills
    }
}

impl Default for PersonaDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
