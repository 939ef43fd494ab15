use std::path::PathBuf;

use printpdf::{Color, IndirectFontRef, Mm, PdfDocument, PdfLayerReference, Rect, Rgb};
use thiserror::Error;

use crate::core::config::CertificateSettings;
use crate::services::qr::QrImage;

const PAGE_WIDTH_MM: f32 = 297.0;
const PAGE_HEIGHT_MM: f32 = 210.0;
const QR_SIDE_MM: f32 = 42.0;
const QR_LEFT_MM: f32 = 236.0;
const QR_BOTTOM_MM: f32 = 22.0;
const PT_TO_MM: f32 = 0.3528;

#[derive(Debug, Error)]
pub(crate) enum RenderError {
    #[error("certificate template asset missing: {0}")]
    TemplateAssetMissing(PathBuf),
    #[error("failed to read template asset: {0}")]
    Io(#[from] std::io::Error),
    #[error("pdf generation failed: {0}")]
    Pdf(String),
}

/// Static texts and assets shared by every printed certificate.
#[derive(Debug, Clone)]
pub(crate) struct CertificateTemplate {
    pub(crate) font_path: PathBuf,
    pub(crate) issuer: String,
    pub(crate) authority_line: String,
    pub(crate) director_name: String,
    pub(crate) director_title: String,
    pub(crate) qr_caption: String,
}

impl CertificateTemplate {
    pub(crate) fn from_settings(settings: &CertificateSettings) -> Self {
        Self {
            font_path: PathBuf::from(&settings.font_path),
            issuer: settings.issuer.clone(),
            authority_line: settings.authority_line.clone(),
            director_name: settings.director_name.clone(),
            director_title: settings.director_title.clone(),
            qr_caption: settings.qr_caption.clone(),
        }
    }
}

/// Values printed on one certificate, already formatted for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentFields {
    pub(crate) certificate_number: String,
    pub(crate) student_name: String,
    pub(crate) course_name: String,
    pub(crate) hours: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
    pub(crate) issue_date: String,
    pub(crate) expiry_date: String,
}

pub(crate) trait DocumentRenderer: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn file_name(&self) -> &'static str;

    fn render(
        &self,
        template: &CertificateTemplate,
        fields: &DocumentFields,
        qr: &QrImage,
    ) -> Result<Vec<u8>, RenderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PdfRenderer;

impl DocumentRenderer for PdfRenderer {
    fn content_type(&self) -> &'static str {
        "application/pdf"
    }

    fn file_name(&self) -> &'static str {
        "certificate.pdf"
    }

    fn render(
        &self,
        template: &CertificateTemplate,
        fields: &DocumentFields,
        qr: &QrImage,
    ) -> Result<Vec<u8>, RenderError> {
        if !template.font_path.is_file() {
            return Err(RenderError::TemplateAssetMissing(template.font_path.clone()));
        }
        let font_bytes = std::fs::read(&template.font_path)?;

        let (doc, page, layer) = PdfDocument::new(
            format!("Certificate {}", fields.certificate_number),
            Mm(PAGE_WIDTH_MM),
            Mm(PAGE_HEIGHT_MM),
            "certificate",
        );
        let font = doc
            .add_external_font(&font_bytes[..])
            .map_err(|err| RenderError::Pdf(err.to_string()))?;
        let layer = doc.get_page(page).get_layer(layer);
        layer.set_fill_color(Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None)));

        centered(&layer, &font, &template.authority_line, 11.0, 188.0);
        centered(&layer, &font, &template.issuer, 20.0, 172.0);
        centered(&layer, &font, "CERTIFICATE", 34.0, 150.0);
        centered(&layer, &font, &format!("No. {}", fields.certificate_number), 14.0, 138.0);
        centered(&layer, &font, &fields.student_name, 24.0, 118.0);
        centered(&layer, &font, &fields.course_name, 15.0, 104.0);

        let details = [
            fields.hours.as_deref().map(|value| format!("Hours: {value}")),
            fields.level.as_deref().map(|value| format!("Level: {value}")),
            fields.control.as_deref().map(|value| format!("Assessment: {value}")),
        ];
        let mut line_y = 94.0;
        for line in details.into_iter().flatten() {
            centered(&layer, &font, &line, 11.0, line_y);
            line_y -= 7.0;
        }

        layer.use_text(format!("Issued: {}", fields.issue_date), 11.0, Mm(24.0), Mm(40.0), &font);
        layer.use_text(
            format!("Valid until: {}", fields.expiry_date),
            11.0,
            Mm(24.0),
            Mm(33.0),
            &font,
        );
        centered(&layer, &font, &template.director_title, 11.0, 40.0);
        centered(&layer, &font, &template.director_name, 11.0, 33.0);

        draw_qr(&layer, qr);
        layer.use_text(
            template.qr_caption.clone(),
            8.0,
            Mm(QR_LEFT_MM),
            Mm(QR_BOTTOM_MM - 6.0),
            &font,
        );

        doc.save_to_bytes().map_err(|err| RenderError::Pdf(err.to_string()))
    }
}

/// Rough horizontal centring; glyph width is approximated as half the em size.
fn centered(layer: &PdfLayerReference, font: &IndirectFontRef, text: &str, size: f32, y: f32) {
    let width = text.chars().count() as f32 * size * 0.5 * PT_TO_MM;
    let x = ((PAGE_WIDTH_MM - width) / 2.0).max(10.0);
    layer.use_text(text.to_string(), size, Mm(x), Mm(y), font);
}

fn draw_qr(layer: &PdfLayerReference, qr: &QrImage) {
    let matrix = &qr.matrix;
    if matrix.width == 0 {
        return;
    }
    let module = QR_SIDE_MM / matrix.width as f32;
    let top = QR_BOTTOM_MM + QR_SIDE_MM;

    for y in 0..matrix.width {
        for x in 0..matrix.width {
            if !matrix.is_dark(x, y) {
                continue;
            }
            let left = QR_LEFT_MM + x as f32 * module;
            let upper = top - y as f32 * module;
            layer.add_rect(Rect::new(Mm(left), Mm(upper - module), Mm(left + module), Mm(upper)));
        }
    }
}
