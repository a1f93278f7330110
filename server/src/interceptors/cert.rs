use tonic::{Request, Status};
use x509_parser::prelude::{FromDer, X509Certificate};

/// A tonic interceptor service function.
///
/// Extracts the subject common name from the verified client certificate and
/// adds it to the request extensions as the caller's identity. Requests that
/// carry no usable identity never reach a handler.
pub fn extract_identity(mut req: Request<()>) -> Result<Request<()>, Status> {
    let client_certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
    let Some(cert_der) = client_certs.first() else {
        return Err(Status::unauthenticated("request missing client certificate"));
    };

    // rustls hands the verified chain over DER-encoded.
    let (rem, cert) = X509Certificate::from_der(cert_der.as_ref())
        .map_err(|_| Status::unauthenticated("malformed client certificate"))?;
    if !rem.is_empty() {
        return Err(Status::unauthenticated("malformed client certificate"));
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Status::unauthenticated("client certificate missing common name"))?;

    req.extensions_mut().insert(Identity {
        user: common_name.to_string(),
    });
    Ok(req)
}

/// The authenticated caller, as named by its client certificate.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: String,
}
