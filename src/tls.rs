//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 构建 Rustls 配置（未提供证书时生成内存中的自签名证书）。
pub async fn build_rustls_config(
    args: &Args,
    host: IpAddr,
) -> Result<RustlsConfig, std::io::Error> {
    let (cert, key) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (fs::read(cert).await?, fs::read(key).await?),
        _ => self_signed_pem(host)?,
    };
    RustlsConfig::from_pem(cert, key).await
}

/// 生成自签名证书，返回 PEM 编码的证书与私钥。
fn self_signed_pem(host: IpAddr) -> Result<(Vec<u8>, Vec<u8>), std::io::Error> {
    let cert = generate_simple_self_signed([host.to_string(), "localhost".to_string()])
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    info!(%host, "generated self-signed cert");
    Ok((
        cert.cert.pem().into_bytes(),
        cert.key_pair.serialize_pem().into_bytes(),
    ))
}
