use std::sync::OnceLock;

/// Select the process-wide rustls `CryptoProvider` before the first TLS handshake.
///
/// Both the WebSocket connector and the reqwest client used for event streams build rustls
/// configs. When more than one provider is compiled in, rustls cannot pick a default and
/// panics on first use, so every transport calls this before opening.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another component already installed one; keep theirs.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
