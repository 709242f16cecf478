//! Meta-fetchers and plugins shipped with the worker

use chrono::Utc;
use std::net::IpAddr;
use tracing::debug;
use url::{Host, ParseError, Url};

use cif_common::{Observable, ObservableType, Result};

use super::{Enricher, Plugin};

/// Stamps `reporttime` when the feed did not provide one
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportTime;

impl Enricher for ReportTime {
    fn name(&self) -> &str {
        "reporttime"
    }

    fn enrich(&self, mut observable: Observable) -> Result<Observable> {
        let now = Utc::now();
        if observable.reporttime.is_none() {
            observable.reporttime = Some(now);
        }
        observable
            .meta
            .insert("processed_at".to_string(), serde_json::Value::String(now.to_rfc3339()));
        Ok(observable)
    }
}

/// Derives the host of a URL observable as an fqdn, ipv4 or ipv6 observable.
///
/// A value that does not parse as a URL has nothing to derive.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlFqdn;

impl Plugin for UrlFqdn {
    fn name(&self) -> &str {
        "url_fqdn"
    }

    fn derive(&self, observable: &Observable) -> Result<Vec<Observable>> {
        if observable.otype() != ObservableType::Url {
            return Ok(Vec::new());
        }

        let raw = observable.value();
        // Feeds frequently drop the scheme
        let parsed = match Url::parse(raw) {
            Err(ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{}", raw)),
            other => other,
        };
        let url = match parsed {
            Ok(url) => url,
            Err(e) => {
                debug!(plugin = %self.name(), value = %raw, error = %e, "Unparsable url, nothing to derive");
                return Ok(Vec::new());
            },
        };

        let derived = match url.host() {
            Some(Host::Domain(domain)) => match domain.parse::<IpAddr>() {
                Ok(ip) => Some(ip_observable(observable, ip)),
                Err(_) => Some(observable.derive(ObservableType::Fqdn, domain.to_lowercase())),
            },
            Some(Host::Ipv4(ip)) => Some(ip_observable(observable, IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => Some(ip_observable(observable, IpAddr::V6(ip))),
            None => None,
        };

        Ok(derived.into_iter().collect())
    }
}

fn ip_observable(parent: &Observable, ip: IpAddr) -> Observable {
    match ip {
        IpAddr::V4(v4) => parent.derive(ObservableType::Ipv4, v4.to_string()),
        IpAddr::V6(v6) => parent.derive(ObservableType::Ipv6, v6.to_string()),
    }
}

/// Derives the domain part of an email observable
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailFqdn;

impl Plugin for EmailFqdn {
    fn name(&self) -> &str {
        "email_fqdn"
    }

    fn derive(&self, observable: &Observable) -> Result<Vec<Observable>> {
        if observable.otype() != ObservableType::Email {
            return Ok(Vec::new());
        }

        match observable.value().rsplit_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(vec![
                observable.derive(ObservableType::Fqdn, domain.trim_end_matches('.').to_lowercase()),
            ]),
            _ => {
                debug!(plugin = %self.name(), value = %observable.value(), "Not an address, nothing to derive");
                Ok(Vec::new())
            },
        }
    }
}
