//! Single-slot model residency.
//!
//! At most one species model is resident. Switching species drops the resident
//! model before the next load starts, so two models never coexist in memory on
//! constrained edge hardware.

use crate::detect::{LoadError, ModelLoader};
use crate::mode::Species;

struct LoadedModel<M> {
    species: Species,
    model: M,
}

pub struct ModelCache<L: ModelLoader> {
    loader: L,
    resident: Option<LoadedModel<L::Model>>,
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            resident: None,
        }
    }

    /// Return the model for `species`, loading it if another (or none) is resident.
    ///
    /// On failure the cache is left empty.
    pub fn ensure_loaded(&mut self, species: &Species) -> Result<&L::Model, LoadError> {
        match self.resident.take() {
            Some(loaded) if loaded.species == *species => {
                Ok(&self.resident.insert(loaded).model)
            }
            previous => {
                if let Some(previous) = previous {
                    log::info!("releasing model for '{}'", previous.species);
                    drop(previous);
                }
                log::info!("loading {} model for '{}'", self.loader.name(), species);
                let model = self.loader.load(species)?;
                let loaded = self.resident.insert(LoadedModel {
                    species: species.clone(),
                    model,
                });
                Ok(&loaded.model)
            }
        }
    }

    /// Release the resident model, if any.
    pub fn unload(&mut self) {
        self.release();
    }

    pub fn current(&self) -> Option<&L::Model> {
        self.resident.as_ref().map(|loaded| &loaded.model)
    }

    pub fn loaded_species(&self) -> Option<&Species> {
        self.resident.as_ref().map(|loaded| &loaded.species)
    }

    pub fn is_empty(&self) -> bool {
        self.resident.is_none()
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn release(&mut self) {
        if let Some(previous) = self.resident.take() {
            log::info!("releasing model for '{}'", previous.species);
            drop(previous);
        }
    }
}
