use crate::events::AccessStatus;
use crate::face::FaceMatch;
use crate::registry::{IdentityDetails, Registry, VehicleRecord};

#[derive(Clone, Debug, PartialEq)]
pub struct FaceDecision {
    pub face: FaceMatch,
    pub status: AccessStatus,
    pub details: Option<IdentityDetails>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlateDecision {
    pub plate: String,
    pub status: AccessStatus,
    pub owner: Option<VehicleRecord>,
}

/// A face is authorized exactly when it matched a registered name.
pub fn resolve_face(registry: &Registry, face: FaceMatch) -> FaceDecision {
    if face.is_known() {
        let details = registry.details(&face.name).cloned();
        FaceDecision {
            face,
            status: AccessStatus::Authorized,
            details,
        }
    } else {
        FaceDecision {
            face,
            status: AccessStatus::Unauthorized,
            details: None,
        }
    }
}

/// Exact match against the registered plates; a miss is unauthorized.
pub fn resolve_plate(registry: &Registry, plate: &str) -> PlateDecision {
    let owner = registry.vehicle(plate).cloned();
    PlateDecision {
        plate: plate.to_string(),
        status: if owner.is_some() {
            AccessStatus::Authorized
        } else {
            AccessStatus::Unauthorized
        },
        owner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VehicleType;

    fn registry() -> Registry {
        let mut registry = Registry::default();
        let details = IdentityDetails {
            roll_no: "21CS01".into(),
            branch: "CSE".into(),
        };
        registry.add_face("Asha", vec![0.0, 1.0], details);
        registry.add_vehicle(VehicleRecord {
            owner_name: "Asha".into(),
            roll_no: "21CS01".into(),
            branch: "CSE".into(),
            plate_number: "KA01AB1234".into(),
            vehicle_type: VehicleType::Bike,
        });
        registry
    }

    #[test]
    fn known_face_carries_registry_details() {
        let registry = registry();
        let decision = resolve_face(&registry, registry.match_face(&[0.0, 1.0], 0.6));
        assert_eq!(decision.status, AccessStatus::Authorized);
        assert_eq!(decision.details.unwrap().roll_no, "21CS01");

        let stranger = resolve_face(&registry, registry.match_face(&[3.0, 3.0], 0.6));
        assert_eq!(stranger.status, AccessStatus::Unauthorized);
        assert!(stranger.details.is_none());
    }

    #[test]
    fn plate_lookup_is_exact() {
        let registry = registry();
        assert_eq!(
            resolve_plate(&registry, "KA01AB1234").status,
            AccessStatus::Authorized
        );
        let miss = resolve_plate(&registry, "KA01AB123");
        assert_eq!(miss.status, AccessStatus::Unauthorized);
        assert!(miss.owner.is_none());
    }
}
