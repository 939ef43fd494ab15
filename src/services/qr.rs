use qrcode::render::svg;
use qrcode::{Color, EcLevel, QrCode};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorCorrection {
    Low,
    Medium,
    Quartile,
    High,
}

impl From<ErrorCorrection> for EcLevel {
    fn from(value: ErrorCorrection) -> Self {
        match value {
            ErrorCorrection::Low => EcLevel::L,
            ErrorCorrection::Medium => EcLevel::M,
            ErrorCorrection::Quartile => EcLevel::Q,
            ErrorCorrection::High => EcLevel::H,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum QrError {
    #[error("qr payload is empty")]
    EmptyPayload,
    #[error("qr encoding failed: {0}")]
    Encode(String),
}

/// Square module grid, row-major, `true` for dark modules.
#[derive(Debug, Clone)]
pub(crate) struct QrMatrix {
    pub(crate) width: usize,
    pub(crate) dark: Vec<bool>,
}

impl QrMatrix {
    pub(crate) fn is_dark(&self, x: usize, y: usize) -> bool {
        self.dark.get(y * self.width + x).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QrImage {
    pub(crate) payload: String,
    pub(crate) svg: Vec<u8>,
    pub(crate) matrix: QrMatrix,
}

pub(crate) trait QrEncoder: Send + Sync {
    fn encode(&self, payload: &str, size: u32, level: ErrorCorrection) -> Result<QrImage, QrError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SvgQrEncoder;

impl QrEncoder for SvgQrEncoder {
    fn encode(&self, payload: &str, size: u32, level: ErrorCorrection) -> Result<QrImage, QrError> {
        if payload.is_empty() {
            return Err(QrError::EmptyPayload);
        }

        let code = QrCode::with_error_correction_level(payload.as_bytes(), level.into())
            .map_err(|err| QrError::Encode(err.to_string()))?;

        let svg = code
            .render::<svg::Color<'_>>()
            .min_dimensions(size, size)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build();

        let matrix = QrMatrix {
            width: code.width(),
            dark: code.to_colors().into_iter().map(|color| color == Color::Dark).collect(),
        };

        Ok(QrImage { payload: payload.to_string(), svg: svg.into_bytes(), matrix })
    }
}
