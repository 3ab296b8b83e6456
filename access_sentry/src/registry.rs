use std::collections::HashMap;

use anyhow::Result;
use opencv::core::Vector;
use opencv::imgcodecs::imdecode;
use opencv::imgcodecs::IMREAD_COLOR;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use serde::Serialize;
use tracing::{info, warn};

use crate::face::{match_face, Embedding, FaceAnalysis, FaceMatch};
use crate::plate_detection::plate_reader::normalize_plate;
use crate::store::{check_registrable, RegistryStore, VehicleType};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdentityDetails {
    pub roll_no: String,
    pub branch: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VehicleRecord {
    pub owner_name: String,
    pub roll_no: String,
    pub branch: String,
    pub plate_number: String,
    pub vehicle_type: VehicleType,
}

/// Snapshot of the known faces and vehicles. Built once per pipeline run
/// and never mutated afterwards.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    embeddings: Vec<Embedding>,
    /// Parallel to `embeddings`.
    names: Vec<String>,
    details: HashMap<String, IdentityDetails>,
    vehicles: HashMap<String, VehicleRecord>,
}

impl Registry {
    pub fn add_face(&mut self, name: &str, embedding: Embedding, details: IdentityDetails) {
        self.embeddings.push(embedding);
        self.names.push(name.to_string());
        self.details.insert(name.to_string(), details);
    }

    /// Registers a vehicle under its normalized plate. Plates that normalize
    /// to nothing are ignored.
    pub fn add_vehicle(&mut self, mut vehicle: VehicleRecord) -> bool {
        let Some(plate) = normalize_plate(&vehicle.plate_number) else {
            return false;
        };
        vehicle.plate_number = plate.clone();
        self.vehicles.insert(plate, vehicle);
        true
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn match_face(&self, query: &[f32], tolerance: f32) -> FaceMatch {
        match_face(query, &self.embeddings, &self.names, tolerance)
    }

    pub fn details(&self, name: &str) -> Option<&IdentityDetails> {
        self.details.get(name)
    }

    /// Exact lookup of a normalized plate.
    pub fn vehicle(&self, plate: &str) -> Option<&VehicleRecord> {
        self.vehicles.get(plate)
    }

    pub fn face_count(&self) -> usize {
        self.embeddings.len()
    }

    pub fn identity_count(&self) -> usize {
        self.details.len()
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }
}

fn decode(data: &[u8]) -> Option<Mat> {
    let buffer = Vector::<u8>::from_slice(data);
    match imdecode(&buffer, IMREAD_COLOR) {
        Ok(image) if !image.empty() => Some(image),
        _ => None,
    }
}

/// Reads every registered identity, embeds the first face of each reference
/// image and indexes vehicles by plate. Bad images are skipped.
pub fn load(store: &dyn RegistryStore, faces: &mut dyn FaceAnalysis) -> Result<Registry> {
    let mut registry = Registry::default();
    let identities = store.identities()?;

    for identity in &identities {
        if check_registrable(identity).is_err() {
            warn!(name = %identity.name, roll_no = %identity.roll_no, "reserved name, skipped");
            continue;
        }
        let details = IdentityDetails {
            roll_no: identity.roll_no.clone(),
            branch: identity.branch.clone(),
        };

        let mut usable = 0;
        for image in &identity.images {
            let Some(decoded) = decode(&image.data) else {
                warn!(name = %identity.name, image = %image.name, "invalid image format");
                continue;
            };
            let embedding = match first_embedding(faces, &decoded) {
                Ok(Some(embedding)) => embedding,
                Ok(None) => {
                    warn!(name = %identity.name, image = %image.name, "no face found in image");
                    continue;
                }
                Err(e) => {
                    warn!(
                        name = %identity.name,
                        image = %image.name,
                        "error processing image: {e}"
                    );
                    continue;
                }
            };
            registry.add_face(&identity.name, embedding, details.clone());
            usable += 1;
        }
        if usable > 0 {
            info!(name = %identity.name, images = usable, "loaded face data");
        }

        if let Some(vehicle) = &identity.vehicle {
            let record = VehicleRecord {
                owner_name: identity.name.clone(),
                roll_no: identity.roll_no.clone(),
                branch: identity.branch.clone(),
                plate_number: vehicle.plate_number.clone(),
                vehicle_type: vehicle.vehicle_type,
            };
            if !registry.add_vehicle(record) {
                warn!(
                    name = %identity.name,
                    plate = %vehicle.plate_number,
                    "unusable plate number"
                );
            }
        }
    }

    info!(
        faces = registry.face_count(),
        identities = registry.identity_count(),
        vehicles = registry.vehicle_count(),
        "registry loaded"
    );
    Ok(registry)
}

fn first_embedding(faces: &mut dyn FaceAnalysis, image: &Mat) -> Result<Option<Embedding>> {
    let boxes = faces.locate_faces(image)?;
    let Some(first) = boxes.first() else {
        return Ok(None);
    };
    Ok(faces.embed(image, std::slice::from_ref(first))?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plates_are_indexed_normalized() {
        let mut registry = Registry::default();
        assert!(registry.add_vehicle(VehicleRecord {
            owner_name: "Asha".into(),
            roll_no: "21CS01".into(),
            branch: "CSE".into(),
            plate_number: "mh 12-de 1433".into(),
            vehicle_type: VehicleType::Car,
        }));
        assert_eq!(registry.vehicle("MH12DE1433").unwrap().owner_name, "Asha");
        assert!(registry.vehicle("mh 12-de 1433").is_none());
        assert!(!registry.add_vehicle(VehicleRecord {
            owner_name: "Ravi".into(),
            roll_no: "21CS02".into(),
            branch: "CSE".into(),
            plate_number: "--".into(),
            vehicle_type: VehicleType::Bike,
        }));
    }
}
