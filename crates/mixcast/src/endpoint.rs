// crates/mixcast/src/endpoint.rs
//
// Endpoint descriptor parsing: one string in, one backend selection out.
//
//   rtmp://host[:port]/app/stream_key      → RTMP publish
//   udp|tcp|http|srt://…                   → MPEG-TS
//   path with a known container extension  → file output
//
// Anything else is BadPath before any resource is touched.

use std::path::PathBuf;

use mixcast_core::MixError;

pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Container extensions libavformat can infer a muxer for.
const FILE_EXTENSIONS: &[&str] = &["mp4", "flv", "ts", "mkv", "mov"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsTransport {
    /// udp/tcp/http — libavformat opens the URL itself.
    Avio,
    /// srt — a custom AVIO write callback drives the SRT socket.
    Srt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Rtmp(RtmpTarget),
    MpegTs { url: String, transport: TsTransport },
    File(PathBuf),
}

pub fn parse_endpoint(descriptor: &str) -> Result<Endpoint, MixError> {
    let descriptor = descriptor.trim();
    if descriptor.is_empty() {
        return Err(MixError::BadPath("empty endpoint".into()));
    }

    if let Some((scheme, rest)) = descriptor.split_once("://") {
        return match scheme.to_ascii_lowercase().as_str() {
            "rtmp" => parse_rtmp(rest).map(Endpoint::Rtmp),
            "udp" | "tcp" | "http" => Ok(Endpoint::MpegTs {
                url: descriptor.to_string(),
                transport: TsTransport::Avio,
            }),
            "srt" => Ok(Endpoint::MpegTs {
                url: descriptor.to_string(),
                transport: TsTransport::Srt,
            }),
            other => Err(MixError::BadPath(format!("unsupported scheme '{other}'"))),
        };
    }

    let path = PathBuf::from(descriptor);
    let known = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| FILE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if known {
        Ok(Endpoint::File(path))
    } else {
        Err(MixError::BadPath(format!(
            "'{descriptor}' is neither a stream URL nor a known container file"
        )))
    }
}

fn parse_rtmp(rest: &str) -> Result<RtmpTarget, MixError> {
    let (authority, path) = rest
        .split_once('/')
        .ok_or_else(|| MixError::BadPath("rtmp url needs /app/stream_key".into()))?;

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| MixError::BadPath(format!("bad rtmp port '{p}'")))?;
            (h, port)
        }
        None => (authority, DEFAULT_RTMP_PORT),
    };
    if host.is_empty() {
        return Err(MixError::BadPath("rtmp url has no host".into()));
    }

    // the stream key may itself contain slashes; the app is the first
    // path segment only
    let (app, key) = path
        .split_once('/')
        .ok_or_else(|| MixError::BadPath("rtmp url needs a stream key after the app".into()))?;
    if app.is_empty() || key.is_empty() {
        return Err(MixError::BadPath("rtmp app and stream key must be nonempty".into()));
    }

    Ok(RtmpTarget {
        host: host.to_string(),
        port,
        app: app.to_string(),
        stream_key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtmp_with_default_port() {
        let ep = parse_endpoint("rtmp://live.example.com/live/abc-123").unwrap();
        assert_eq!(
            ep,
            Endpoint::Rtmp(RtmpTarget {
                host: "live.example.com".into(),
                port: DEFAULT_RTMP_PORT,
                app: "live".into(),
                stream_key: "abc-123".into(),
            })
        );
    }

    #[test]
    fn rtmp_with_port_and_slashed_key() {
        let ep = parse_endpoint("rtmp://10.0.0.2:19350/app/key/with/slashes").unwrap();
        match ep {
            Endpoint::Rtmp(t) => {
                assert_eq!(t.port, 19350);
                assert_eq!(t.app, "app");
                assert_eq!(t.stream_key, "key/with/slashes");
            }
            other => panic!("unexpected endpoint {other:?}"),
        }
    }

    #[test]
    fn mpegts_schemes() {
        for (url, transport) in [
            ("udp://239.0.0.1:1234", TsTransport::Avio),
            ("tcp://encoder:9000", TsTransport::Avio),
            ("http://origin/push", TsTransport::Avio),
            ("srt://relay:7000?streamid=x", TsTransport::Srt),
        ] {
            match parse_endpoint(url).unwrap() {
                Endpoint::MpegTs { url: u, transport: t } => {
                    assert_eq!(u, url);
                    assert_eq!(t, transport);
                }
                other => panic!("unexpected endpoint {other:?}"),
            }
        }
    }

    #[test]
    fn file_by_extension() {
        assert!(matches!(
            parse_endpoint("/tmp/out.mp4").unwrap(),
            Endpoint::File(_)
        ));
        assert!(matches!(
            parse_endpoint("recording.FLV").unwrap(),
            Endpoint::File(_)
        ));
    }

    #[test]
    fn rejects_unknown() {
        assert!(matches!(
            parse_endpoint("gopher://x/y"),
            Err(MixError::BadPath(_))
        ));
        assert!(matches!(
            parse_endpoint("/tmp/notes.txt"),
            Err(MixError::BadPath(_))
        ));
        assert!(matches!(
            parse_endpoint("rtmp://host-only"),
            Err(MixError::BadPath(_))
        ));
        assert!(matches!(parse_endpoint(""), Err(MixError::BadPath(_))));
    }
}
