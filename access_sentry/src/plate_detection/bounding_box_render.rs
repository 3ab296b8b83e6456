use anyhow::Result;
use opencv::core::Point;
use opencv::core::Rect;
use opencv::core::Scalar;
use opencv::imgproc::put_text;
use opencv::imgproc::rectangle;
use opencv::imgproc::FILLED;
use opencv::imgproc::FONT_HERSHEY_DUPLEX;
use opencv::imgproc::FONT_HERSHEY_SIMPLEX;
use opencv::imgproc::LINE_8;
use opencv::prelude::Mat;

use crate::authorization::{FaceDecision, PlateDecision};
use crate::events::AccessStatus;

use super::{BoundingBox, Detection};

fn green() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

fn red() -> Scalar {
    Scalar::new(0.0, 0.0, 255.0, 0.0)
}

fn blue() -> Scalar {
    Scalar::new(255.0, 0.0, 0.0, 0.0)
}

fn white() -> Scalar {
    Scalar::new(255.0, 255.0, 255.0, 0.0)
}

fn status_color(status: AccessStatus) -> Scalar {
    match status {
        AccessStatus::Authorized => green(),
        AccessStatus::Unauthorized => red(),
    }
}

fn confidence_suffix(confidence: Option<f32>) -> String {
    confidence
        .map(|confidence| format!(" ({confidence:.2})"))
        .unwrap_or_default()
}

/// Text inside the filled bar under a face.
pub fn face_label(decision: &FaceDecision) -> String {
    let suffix = confidence_suffix(decision.face.confidence);
    match decision.status {
        AccessStatus::Authorized => format!("{}{suffix}", decision.face.name),
        AccessStatus::Unauthorized => format!("UNAUTHORIZED{suffix}"),
    }
}

/// Line above an authorized face.
pub fn face_info(decision: &FaceDecision) -> Option<String> {
    let details = decision.details.as_ref()?;
    Some(format!(
        "Branch: {}, Roll: {}",
        details.branch, details.roll_no
    ))
}

/// Lines printed under a plate, top to bottom.
pub fn plate_lines(decision: &PlateDecision) -> Vec<String> {
    let plate = format!("Plate: {}", decision.plate);
    match &decision.owner {
        Some(owner) => vec![
            format!("Owner: {}, Roll: {}", owner.owner_name, owner.roll_no),
            format!("Type: {}", owner.vehicle_type.as_str()),
            plate,
        ],
        None => vec!["UNAUTHORIZED ACCESS".to_string(), plate],
    }
}

pub fn object_label(detection: &Detection) -> String {
    format!("{}: {:.2}", detection.label, detection.confidence)
}

/// Draws pipeline results on top of the displayed frame.
pub struct BoundingBoxRender {
    thickness: i32,
    font_scale: f64,
}

impl Default for BoundingBoxRender {
    fn default() -> Self {
        Self {
            thickness: 2,
            font_scale: 0.5,
        }
    }
}

impl BoundingBoxRender {
    fn text(
        &self,
        image: &mut Mat,
        text: &str,
        origin: Point,
        font: i32,
        color: Scalar,
        thickness: i32,
    ) -> Result<()> {
        put_text(
            image,
            text,
            origin,
            font,
            self.font_scale,
            color,
            thickness,
            LINE_8,
            false,
        )?;
        Ok(())
    }

    fn outline(&self, image: &mut Mat, bbox: BoundingBox, color: Scalar) -> Result<()> {
        rectangle(image, bbox.to_rect(), color, self.thickness, LINE_8, 0)?;
        Ok(())
    }

    /// Blue box and "label: conf" for every detection.
    pub fn draw_objects(&self, image: &mut Mat, detections: &[Detection]) -> Result<()> {
        for detection in detections {
            self.outline(image, detection.bbox, blue())?;
            self.text(
                image,
                &object_label(detection),
                Point::new(detection.bbox.x1, detection.bbox.y1 - 10),
                FONT_HERSHEY_SIMPLEX,
                blue(),
                self.thickness,
            )?;
        }
        Ok(())
    }

    pub fn draw_face(
        &self,
        image: &mut Mat,
        bbox: BoundingBox,
        decision: &FaceDecision,
    ) -> Result<()> {
        let color = status_color(decision.status);
        self.outline(image, bbox, color)?;

        let bar = Rect::new(bbox.x1, bbox.y2 - 35, bbox.width(), 35);
        rectangle(image, bar, color, FILLED, LINE_8, 0)?;
        self.text(
            image,
            &face_label(decision),
            Point::new(bbox.x1 + 6, bbox.y2 - 15),
            FONT_HERSHEY_DUPLEX,
            white(),
            1,
        )?;

        if let Some(info) = face_info(decision) {
            self.text(
                image,
                &info,
                Point::new(bbox.x1, bbox.y1 - 10),
                FONT_HERSHEY_DUPLEX,
                color,
                1,
            )?;
        }
        Ok(())
    }

    /// `bbox` is in frame coordinates.
    pub fn draw_plate(
        &self,
        image: &mut Mat,
        bbox: BoundingBox,
        decision: &PlateDecision,
    ) -> Result<()> {
        let color = status_color(decision.status);
        self.outline(image, bbox, color)?;
        for (line, text) in plate_lines(decision).iter().enumerate() {
            let origin = Point::new(bbox.x1, bbox.y2 + 20 * (line as i32 + 1));
            self.text(image, text, origin, FONT_HERSHEY_SIMPLEX, color, self.thickness)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::FaceMatch;
    use crate::registry::{IdentityDetails, VehicleRecord};
    use crate::store::VehicleType;
    use opencv::core::CV_8UC3;
    use opencv::prelude::MatTraitConst;

    fn known_face() -> FaceDecision {
        FaceDecision {
            face: FaceMatch {
                name: "Asha".into(),
                confidence: Some(0.75),
            },
            status: AccessStatus::Authorized,
            details: Some(IdentityDetails {
                roll_no: "21CS01".into(),
                branch: "CSE".into(),
            }),
        }
    }

    #[test]
    fn face_texts() {
        let known = known_face();
        assert_eq!(face_label(&known), "Asha (0.75)");
        assert_eq!(face_info(&known).unwrap(), "Branch: CSE, Roll: 21CS01");

        let stranger = FaceDecision {
            face: FaceMatch::unknown(None),
            status: AccessStatus::Unauthorized,
            details: None,
        };
        assert_eq!(face_label(&stranger), "UNAUTHORIZED");
        assert!(face_info(&stranger).is_none());
    }

    #[test]
    fn plate_texts() {
        let registered = PlateDecision {
            plate: "KA01AB1234".into(),
            status: AccessStatus::Authorized,
            owner: Some(VehicleRecord {
                owner_name: "Asha".into(),
                roll_no: "21CS01".into(),
                branch: "CSE".into(),
                plate_number: "KA01AB1234".into(),
                vehicle_type: VehicleType::Bike,
            }),
        };
        assert_eq!(
            plate_lines(&registered),
            vec![
                "Owner: Asha, Roll: 21CS01".to_string(),
                "Type: bike".to_string(),
                "Plate: KA01AB1234".to_string(),
            ]
        );

        let unknown = PlateDecision {
            plate: "XY99".into(),
            status: AccessStatus::Unauthorized,
            owner: None,
        };
        assert_eq!(
            plate_lines(&unknown),
            vec!["UNAUTHORIZED ACCESS".to_string(), "Plate: XY99".to_string()]
        );
    }

    #[test]
    fn drawing_marks_the_frame() {
        let mut image =
            Mat::new_rows_cols_with_default(200, 200, CV_8UC3, Scalar::all(0.0)).unwrap();
        let render = BoundingBoxRender::default();
        render
            .draw_face(&mut image, BoundingBox::new(40, 40, 160, 160), &known_face())
            .unwrap();
        let pixel = image.at_2d::<opencv::core::Vec3b>(159, 100).unwrap();
        assert_eq!(pixel[1], 255);
    }
}
