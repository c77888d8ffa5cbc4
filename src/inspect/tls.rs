//! TLS certificate expiry via a handshake with certificate verification off.
//!
//! The leaf certificate is read even when expired, self-signed or issued for
//! another name, so expiry can still be reported for broken setups.

use chrono::{DateTime, NaiveDateTime, Utc};
use native_tls::TlsConnector;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::InspectError;

pub const HTTPS_PORT: u16 = 443;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_EXPLICIT_VERSION: u8 = 0xA0;
const TAG_UTC_TIME: u8 = 0x17;
const TAG_GENERALIZED_TIME: u8 = 0x18;

/// Handshake with `host:port` (SNI = host) and return the leaf certificate's
/// "not after" instant. `Ok(None)` if the peer presented no certificate.
pub async fn fetch_certificate_expiry(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Option<DateTime<Utc>>, InspectError> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| InspectError::Tls(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let handshake = async {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| InspectError::Tls(format!("connect to {}:{}: {}", host, port, e)))?;
        connector
            .connect(host, stream)
            .await
            .map_err(|e| InspectError::Tls(e.to_string()))
    };

    let tls_stream = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| InspectError::Timeout(format!("TLS handshake with {}", host)))??;

    let Some(cert) = tls_stream
        .get_ref()
        .peer_certificate()
        .map_err(|e| InspectError::Certificate(e.to_string()))?
    else {
        debug!("{} presented no certificate", host);
        return Ok(None);
    };

    let der = cert
        .to_der()
        .map_err(|e| InspectError::Certificate(e.to_string()))?;

    let (_, not_after) = certificate_validity(&der)?;
    Ok(Some(not_after))
}

/// `(not_before, not_after)` from a DER-encoded X.509 certificate.
pub fn certificate_validity(der: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>), InspectError> {
    let malformed = |what: &str| InspectError::Certificate(format!("malformed certificate: {}", what));

    let (tag, cert, _) = read_tlv(der).ok_or_else(|| malformed("outer"))?;
    if tag != TAG_SEQUENCE {
        return Err(malformed("outer"));
    }
    let (tag, tbs, _) = read_tlv(cert).ok_or_else(|| malformed("tbsCertificate"))?;
    if tag != TAG_SEQUENCE {
        return Err(malformed("tbsCertificate"));
    }

    let mut rest = tbs;
    if rest.first() == Some(&TAG_EXPLICIT_VERSION) {
        rest = read_tlv(rest).ok_or_else(|| malformed("version"))?.2;
    }
    // serialNumber, signature, issuer
    for field in ["serialNumber", "signature", "issuer"] {
        rest = read_tlv(rest).ok_or_else(|| malformed(field))?.2;
    }

    let (tag, validity, _) = read_tlv(rest).ok_or_else(|| malformed("validity"))?;
    if tag != TAG_SEQUENCE {
        return Err(malformed("validity"));
    }

    let (tag, raw, rest) = read_tlv(validity).ok_or_else(|| malformed("notBefore"))?;
    let not_before = parse_asn1_time(tag, raw).ok_or_else(|| malformed("notBefore"))?;
    let (tag, raw, _) = read_tlv(rest).ok_or_else(|| malformed("notAfter"))?;
    let not_after = parse_asn1_time(tag, raw).ok_or_else(|| malformed("notAfter"))?;

    Ok((not_before, not_after))
}

/// Split one DER element into `(tag, contents, remaining)`.
fn read_tlv(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, buf) = buf.split_first()?;
    let (&first, buf) = buf.split_first()?;

    let (len, buf) = if first & 0x80 == 0 {
        (first as usize, buf)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || buf.len() < n {
            return None;
        }
        let len = buf[..n].iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, &buf[n..])
    };

    if buf.len() < len {
        return None;
    }
    Some((tag, &buf[..len], &buf[len..]))
}

/// UTCTime (two-digit year, 50..99 => 19xx) or GeneralizedTime, UTC only.
fn parse_asn1_time(tag: u8, raw: &[u8]) -> Option<DateTime<Utc>> {
    let s = std::str::from_utf8(raw).ok()?.trim_end_matches('Z');
    let full = match tag {
        TAG_UTC_TIME => {
            let yy: u32 = s.get(0..2)?.parse().ok()?;
            let century = if yy >= 50 { "19" } else { "20" };
            format!("{}{}", century, s)
        }
        TAG_GENERALIZED_TIME => s.to_string(),
        _ => return None,
    };

    NaiveDateTime::parse_from_str(full.get(0..14)?, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        match content.len() {
            n if n < 0x80 => out.push(n as u8),
            n if n <= 0xff => out.extend_from_slice(&[0x81, n as u8]),
            n => out.extend_from_slice(&[0x82, (n >> 8) as u8, n as u8]),
        }
        out.extend_from_slice(content);
        out
    }

    fn fake_certificate(not_before: (u8, &str), not_after: (u8, &str)) -> Vec<u8> {
        let algorithm = tlv(0x30, &tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]));
        // Big enough issuer to force long-form lengths
        let issuer = tlv(0x30, &tlv(0x0c, &[b'x'; 300]));
        let validity = tlv(
            0x30,
            &[
                tlv(not_before.0, not_before.1.as_bytes()),
                tlv(not_after.0, not_after.1.as_bytes()),
            ]
            .concat(),
        );

        let tbs = tlv(
            0x30,
            &[
                tlv(TAG_EXPLICIT_VERSION, &tlv(0x02, &[2])),
                tlv(0x02, &[0x01, 0x23]),
                algorithm.clone(),
                issuer,
                validity,
                tlv(0x30, &[]),
            ]
            .concat(),
        );

        tlv(0x30, &[tbs, algorithm, tlv(0x03, &[0x00, 0xff])].concat())
    }

    #[test]
    fn test_certificate_validity() {
        let der = fake_certificate(
            (TAG_UTC_TIME, "240101000000Z"),
            (TAG_GENERALIZED_TIME, "20350615123000Z"),
        );
        let (not_before, not_after) = certificate_validity(&der).unwrap();
        assert_eq!(not_before, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(not_after, Utc.with_ymd_and_hms(2035, 6, 15, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_utc_time_century() {
        assert_eq!(
            parse_asn1_time(TAG_UTC_TIME, b"991231235959Z"),
            Some(Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap())
        );
        assert_eq!(
            parse_asn1_time(TAG_UTC_TIME, b"490101000000Z"),
            Some(Utc.with_ymd_and_hms(2049, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_asn1_time(0x04, b"490101000000Z"), None);
    }

    #[test]
    fn test_truncated_certificate_rejected() {
        let der = fake_certificate(
            (TAG_UTC_TIME, "240101000000Z"),
            (TAG_UTC_TIME, "250101000000Z"),
        );
        let err = certificate_validity(&der[..der.len() / 2]).unwrap_err();
        assert!(matches!(err, InspectError::Certificate(_)));
        tokio_test::assert_err!(certificate_validity(&[]));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Plain TCP peer that hangs up immediately
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let result = fetch_certificate_expiry("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(InspectError::Tls(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            }
        });

        let result = fetch_certificate_expiry("127.0.0.1", port, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(InspectError::Timeout(_))));
    }
}
