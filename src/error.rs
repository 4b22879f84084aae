use std::fmt;

pub const GENERIC_FAILURE_MESSAGE: &str =
    "Ocurrió un error al generar el PDF. Revisa el registro de diagnóstico.";

#[derive(Debug)]
pub enum StampError {
    MissingDocument,
    MissingStamp,
    MissingBaseImage,
    Pdf(String),
    Raster(String),
    Image(String),
    Font(String),
    Cancelled,
    InvalidConfiguration(String),
    Io(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    RenderingIo,
    Configuration,
}

impl StampError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StampError::MissingDocument
            | StampError::MissingStamp
            | StampError::MissingBaseImage => ErrorKind::Precondition,
            StampError::InvalidConfiguration(_) => ErrorKind::Configuration,
            StampError::Pdf(_)
            | StampError::Raster(_)
            | StampError::Image(_)
            | StampError::Font(_)
            | StampError::Cancelled
            | StampError::Io(_) => ErrorKind::RenderingIo,
        }
    }

    pub fn is_precondition(&self) -> bool {
        self.kind() == ErrorKind::Precondition
    }

    /// Text for the blocking notification shown to the user. Every
    /// rendering/IO failure collapses into the same generic message; the
    /// detail only goes to the diagnostic log.
    pub fn user_message(&self) -> &'static str {
        match self {
            StampError::MissingDocument => "Carga un PDF primero.",
            StampError::MissingStamp => "Primero carga una imagen de sello.",
            StampError::MissingBaseImage => "La imagen del sello todavía no está lista.",
            StampError::InvalidConfiguration(_) => "Configuración no válida.",
            _ => GENERIC_FAILURE_MESSAGE,
        }
    }
}

impl fmt::Display for StampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StampError::MissingDocument => write!(f, "no document loaded"),
            StampError::MissingStamp => write!(f, "no stamp bitmap available"),
            StampError::MissingBaseImage => write!(f, "stamp base image not loaded"),
            StampError::Pdf(message) => write!(f, "pdf error: {}", message),
            StampError::Raster(message) => write!(f, "raster error: {}", message),
            StampError::Image(message) => write!(f, "image error: {}", message),
            StampError::Font(message) => write!(f, "font error: {}", message),
            StampError::Cancelled => write!(f, "rasterization cancelled"),
            StampError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            StampError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for StampError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StampError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StampError {
    fn from(value: std::io::Error) -> Self {
        StampError::Io(value)
    }
}

impl From<lopdf::Error> for StampError {
    fn from(value: lopdf::Error) -> Self {
        StampError::Pdf(value.to_string())
    }
}

impl From<image::ImageError> for StampError {
    fn from(value: image::ImageError) -> Self {
        StampError::Image(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_errors_have_specific_messages() {
        assert!(StampError::MissingDocument.is_precondition());
        assert!(StampError::MissingStamp.is_precondition());
        assert_ne!(
            StampError::MissingDocument.user_message(),
            GENERIC_FAILURE_MESSAGE
        );
    }

    #[test]
    fn rendering_failures_share_one_generic_message() {
        let errors = [
            StampError::Pdf("bad xref".to_string()),
            StampError::Raster("boom".to_string()),
            StampError::Cancelled,
            StampError::Io(std::io::Error::other("disk")),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::RenderingIo);
            assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
        }
    }
}
