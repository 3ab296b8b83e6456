use std::ffi::CString;

use anyhow::{anyhow, Result};
use leptess::tesseract;
use leptess::tesseract::TessApi;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;
use tesseract_plumbing::Text;
use tracing::debug;

use super::{TextFragment, TextRecognition};

const PLATE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Tesseract page segmentation mode for a single line of text.
const PSM_SINGLE_LINE: &str = "7";
const TSV_WORD_LEVEL: &str = "5";

/// Tesseract backed text reader. Expects single channel 8 bit images, as
/// produced by `prepare_for_ocr`.
pub struct DnnOcrReader {
    ocr: TessApi,
}

impl DnnOcrReader {
    pub fn new(data_path: &str, language: &str) -> Result<Self> {
        let mut api = tesseract::TessApi::new(Some(data_path), language)
            .map_err(|e| anyhow!("cannot start tesseract with {data_path}/{language}: {e:?}"))?;

        api.raw.set_variable(
            &CString::new("tessedit_char_whitelist")?,
            &CString::new(PLATE_ALPHABET)?,
        )?;
        api.raw.set_variable(
            &CString::new("tessedit_pageseg_mode")?,
            &CString::new(PSM_SINGLE_LINE)?,
        )?;

        Ok(Self { ocr: api })
    }
}

/// Word rows of a Tesseract TSV dump, in reading order. Confidences are
/// rescaled from 0..100 to 0..1.
pub fn parse_tsv(tsv: &str) -> Vec<TextFragment> {
    tsv.lines()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split('\t').collect();
            if columns.len() < 12 || columns[0] != TSV_WORD_LEVEL {
                return None;
            }
            let confidence: f32 = columns[10].trim().parse().ok()?;
            let text = columns[11].trim();
            if confidence < 0.0 || text.is_empty() {
                return None;
            }
            Some(TextFragment::new(text, confidence / 100.0))
        })
        .collect()
}

impl TextRecognition for DnnOcrReader {
    fn read(&mut self, image: &Mat) -> Result<Vec<TextFragment>> {
        if image.channels() != 1 {
            return Err(anyhow!(
                "ocr expects a single channel image, got {} channels",
                image.channels()
            ));
        }
        // Make it contiguous
        let image = image.try_clone()?;
        let cols = image.cols();
        let rows = image.rows();
        self.ocr
            .raw
            .set_image(image.data_bytes()?, cols, rows, 1, cols)?;
        let tsv: Text = self.ocr.raw.get_tsv_text(0)?;
        let fragments = parse_tsv(&tsv.as_ref().to_string_lossy());
        debug!(?fragments, "ocr");
        Ok(fragments)
    }
}
