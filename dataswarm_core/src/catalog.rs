//! Catalog server client: UDP status advertisements and JSON queries over HTTP.

use std::net::UdpSocket;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::errors::{Error, Result};

pub const DEFAULT_CATALOG_HOST: &str = "catalog.cse.nd.edu";
pub const DEFAULT_CATALOG_PORT: u16 = 9097;

/// Value of the `type` field advertised by managers.
pub const MANAGER_TYPE: &str = "ds_manager";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogHost {
    pub host: String,
    pub port: u16,
}

impl FromStr for CatalogHost {
    type Err = Error;

    /// `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty catalog host");
        }
        match s.rfind(':') {
            Some(pos) => {
                let port = s[pos + 1..]
                    .parse::<u16>()
                    .map_err(|_| format!("invalid catalog port in {:?}", s))?;
                Ok(CatalogHost {
                    host: s[..pos].to_string(),
                    port,
                })
            }
            None => Ok(CatalogHost {
                host: s.to_string(),
                port: DEFAULT_CATALOG_PORT,
            }),
        }
    }
}

impl ::std::fmt::Display for CatalogHost {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse a comma separated list of catalog hosts.
pub fn parse_hosts(list: &str) -> Result<Vec<CatalogHost>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Send `report` as one datagram to every host. Returns how many sends succeeded.
pub fn send_update(hosts: &[CatalogHost], report: &Value) -> Result<usize> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let text = report.to_string();
    let mut sent = 0;
    for host in hosts {
        match socket.send_to(text.as_bytes(), (host.host.as_str(), host.port)) {
            Ok(_) => {
                debug!("Catalog update sent to {}", host);
                sent += 1;
            }
            Err(e) => warn!("Catalog update to {} failed: {}", host, e),
        }
    }
    Ok(sent)
}

/// Fetch every record known to a catalog server.
pub fn query(host: &CatalogHost, timeout: Duration) -> Result<Vec<Value>> {
    let url = format!("http://{}:{}/query.json", host.host, host.port);
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let body = client.get(&url).send()?.error_for_status()?.bytes()?;
    parse_query_response(&body)
}

/// The body of a query is a json array of records.
pub fn parse_query_response(body: &[u8]) -> Result<Vec<Value>> {
    let entries: Vec<Value> = ::serde_json::from_slice(body)?;
    Ok(entries)
}

/// `(host, port)` of the managers whose project matches `project`.
pub fn filter_managers(entries: &[Value], project: &Regex) -> Vec<(String, u16)> {
    entries
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) == Some(MANAGER_TYPE))
        .filter(|e| {
            e.get("project")
                .and_then(Value::as_str)
                .map_or(false, |p| project.is_match(p))
        })
        .filter_map(|e| {
            let name = e.get("name").and_then(Value::as_str)?;
            let port = e.get("port").and_then(Value::as_u64)?;
            if port == 0 || port > u64::from(u16::max_value()) {
                return None;
            }
            Some((name.to_string(), port as u16))
        })
        .collect()
}

/// Query each catalog in turn until one answers, and return the matching managers.
pub fn find_managers(
    hosts: &[CatalogHost],
    project: &str,
    timeout: Duration,
) -> Result<Vec<(String, u16)>> {
    let regex = Regex::new(&format!("^(?:{})$", project))?;
    let mut last_error = None;
    for host in hosts {
        match query(host, timeout) {
            Ok(entries) => return Ok(filter_managers(&entries, &regex)),
            Err(e) => {
                warn!("Catalog query to {} failed: {}", host, e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(e),
        None => bail!("no catalog hosts configured"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn host_parsing() {
        let h: CatalogHost = "catalog.example.org:9000".parse().unwrap();
        assert_eq!(h.port, 9000);
        let h: CatalogHost = "localhost".parse().unwrap();
        assert_eq!(h.port, DEFAULT_CATALOG_PORT);
        assert!("host:notaport".parse::<CatalogHost>().is_err());
        assert_eq!(parse_hosts("a:1, b").unwrap().len(), 2);
        assert!(parse_hosts("").unwrap().is_empty());
    }

    #[test]
    fn manager_filter() {
        let body = b"[\n\
            {\"type\":\"ds_manager\",\"project\":\"dataswarm\",\"name\":\"h1\",\"port\":9123},\n\
            {\"type\":\"wq_master\",\"project\":\"dataswarm\",\"name\":\"h2\",\"port\":9000},\n\
            {\"type\":\"ds_manager\",\"project\":\"other\",\"name\":\"h3\",\"port\":9124}\n]\n";
        let entries = parse_query_response(body).unwrap();
        assert_eq!(entries.len(), 3);
        let regex = Regex::new("^(?:data.*)$").unwrap();
        assert_eq!(filter_managers(&entries, &regex), vec![("h1".to_string(), 9123)]);
        assert!(parse_query_response(b"no body").is_err());
    }

    /// Serve one request with `reply` and return the catalog address.
    fn serve_once(reply: &'static [u8]) -> (CatalogHost, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0);
                request.extend_from_slice(&buf[..n]);
            }
            assert!(request.starts_with(b"GET /query.json"));
            stream.write_all(reply).unwrap();
        });
        let host = CatalogHost {
            host: "127.0.0.1".into(),
            port,
        };
        (host, server)
    }

    #[test]
    fn query_over_http() {
        let (host, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 68\r\nConnection: close\r\n\r\n\
              [{\"type\":\"ds_manager\",\"project\":\"p\",\"name\":\"localhost\",\"port\":4000}]",
        );
        let found = find_managers(&[host], "p", Duration::from_secs(5)).unwrap();
        assert_eq!(found, vec![("localhost".to_string(), 4000)]);
        server.join().unwrap();
    }

    #[test]
    fn chunked_query_response() {
        let (host, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
              2\r\n[\n\r\n\
              3b\r\n{\"type\":\"ds_manager\",\"project\":\"p\",\"name\":\"h\",\"port\":4001}]\r\n\
              0\r\n\r\n",
        );
        let found = find_managers(&[host], "p", Duration::from_secs(5)).unwrap();
        assert_eq!(found, vec![("h".to_string(), 4001)]);
        server.join().unwrap();
    }

    #[test]
    fn failed_query_status() {
        let (host, server) = serve_once(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]",
        );
        assert!(query(&host, Duration::from_secs(5)).is_err());
        server.join().unwrap();
    }

    #[test]
    fn update_over_udp() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let host = CatalogHost {
            host: "127.0.0.1".into(),
            port: receiver.local_addr().unwrap().port(),
        };
        let report = json!({"type": MANAGER_TYPE, "project": "p", "port": 1});
        assert_eq!(send_update(&[host], &report).unwrap(), 1);
        let mut buf = [0u8; 2048];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        let got: Value = ::serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(got, report);
    }
}
