use std::net::IpAddr;

use camino::Utf8PathBuf;

/// Error types for the ipgeod library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Both mandatory datasets (general and ASN) are absent. This is the
    /// only error lookup callers ever see; everything else degrades to a
    /// partially populated record.
    #[error("no geo datasets are available")]
    NoDatasetsAvailable,

    /// A dataset file could not be opened.
    #[error("failed to open dataset at {path}")]
    DatasetOpen {
        path: Utf8PathBuf,
        #[source]
        source: maxminddb::MaxMindDBError,
    },

    /// IP address lookup failed for a reason other than the address being
    /// absent from the dataset.
    #[error("lookup failed for {ip}")]
    LookupFailed {
        ip: IpAddr,
        #[source]
        source: maxminddb::MaxMindDBError,
    },

    /// The HTTP client itself could not be constructed.
    #[error("failed to build http client")]
    HttpClient(#[source] reqwest::Error),

    /// The update source could not be reached or the transfer failed.
    #[error("source unreachable: {url}")]
    SourceUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The update source answered with a non-success status.
    #[error("download of {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    /// A MaxMind edition was requested without a license key configured.
    #[error("maxmind license key is not set")]
    MissingLicenseKey,

    /// The downloaded body is too small to be a real dataset; most likely
    /// an error page served with a 200 status.
    #[error("downloaded body is suspiciously small ({len} bytes, minimum {min})")]
    SuspiciouslySmall { len: usize, min: usize },

    /// The downloaded body failed format validation.
    #[error("downloaded body failed format validation: {reason}")]
    FormatInvalid { reason: String },

    /// No entry in the downloaded archive matched the expected suffix.
    #[error("no archive member matching suffix {suffix:?}")]
    MemberNotFound { suffix: String },

    /// The staged file passed the surface checks but could not actually be
    /// opened as a dataset.
    #[error("staged file at {path} is not a usable dataset")]
    DatasetInvalid {
        path: Utf8PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using the library error.
pub type Result<T> = std::result::Result<T, Error>;
