//! Route 53 record management
//!
//! The stack's public name is an A record in the hosted zone one label up
//! from the hostname. Changes go through the `aws` CLI as change-batch
//! documents; the batch is written into the working directory before
//! submission so a failed run leaves the exact document behind for
//! inspection.
//!
//! Deletion is exact-match: Route 53 rejects a DELETE whose TTL or value
//! disagrees with the live record, so the current record is read back from
//! the zone first rather than reconstructed from configuration.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Error;
use crate::runner::{argv, CommandRunner, RunOpts};
use crate::Result;

/// TTL applied to the record on create/update
pub const RECORD_TTL: u64 = 60;

/// File name the change batch is written under before submission
pub const CHANGESET_FILE: &str = "rr-changeset.txt";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ChangeBatch {
    changes: [Change; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Change {
    action: &'static str,
    resource_record_set: RecordSet,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RecordSet {
    name: String,
    #[serde(rename = "Type")]
    record_type: &'static str,
    #[serde(rename = "TTL")]
    ttl: u64,
    resource_records: Vec<RecordValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RecordValue {
    value: String,
}

/// Manages the A record for one hostname
pub struct DnsManager<'a> {
    runner: &'a dyn CommandRunner,
    hostname: String,
    workdir: PathBuf,
    zone: OnceCell<String>,
}

impl<'a> DnsManager<'a> {
    /// Create a manager for `hostname`, writing change batches under
    /// `workdir`.
    pub fn new(runner: &'a dyn CommandRunner, hostname: &str, workdir: &Path) -> Self {
        Self {
            runner,
            hostname: hostname.to_string(),
            workdir: workdir.to_path_buf(),
            zone: OnceCell::new(),
        }
    }

    /// The enclosing domain, one label up from the hostname
    pub fn domain(&self) -> Result<String> {
        match self.hostname.split_once('.') {
            Some((_, domain)) if !domain.is_empty() => Ok(domain.to_string()),
            _ => Err(Error::dns(format!(
                "hostname '{}' has no enclosing domain",
                self.hostname
            ))),
        }
    }

    /// Resolve the hosted zone id for the enclosing domain.
    ///
    /// Zone ids come back as paths like `/hostedzone/Z123`; only the final
    /// segment is accepted by later calls. The lookup runs once per manager;
    /// later calls reuse the resolved id.
    pub fn zone_id(&self) -> Result<String> {
        if let Some(zone) = self.zone.get() {
            return Ok(zone.clone());
        }
        let domain = self.domain()?;
        let wanted = format!("{domain}.");
        let out = self.runner.run(
            &argv(&["aws", "route53", "list-hosted-zones", "--output", "json"]),
            &RunOpts::checked().capture(),
        )?;
        let parsed: Value = serde_json::from_str(&out.stdout)?;
        let zones = parsed["HostedZones"].as_array().cloned().unwrap_or_default();
        let id = zones
            .iter()
            .find(|zone| zone["Name"].as_str() == Some(wanted.as_str()))
            .and_then(|zone| zone["Id"].as_str())
            .map(|id| id.rsplit('/').next().unwrap_or(id).to_string())
            .ok_or_else(|| Error::dns(format!("no hosted zone for domain '{domain}'")))?;
        debug!(domain = %domain, zone = %id, "resolved hosted zone");
        Ok(self.zone.get_or_init(|| id).clone())
    }

    /// Point the hostname's A record at `ip`, creating or updating it
    pub fn upsert(&self, ip: &str) -> Result<()> {
        let zone = self.zone_id()?;
        info!(hostname = %self.hostname, ip = %ip, "updating DNS record");
        self.submit(&zone, "UPSERT", RECORD_TTL, ip)
    }

    /// Remove the hostname's A record.
    ///
    /// Fails with [`Error::Dns`] when the record does not exist; teardown
    /// treats that as already-done rather than fatal.
    pub fn delete(&self) -> Result<()> {
        let zone = self.zone_id()?;
        let (ttl, ip) = self.current_record(&zone)?;
        info!(hostname = %self.hostname, ip = %ip, "deleting DNS record");
        self.submit(&zone, "DELETE", ttl, &ip)
    }

    /// Read the live A record's TTL and address from the zone
    fn current_record(&self, zone: &str) -> Result<(u64, String)> {
        let fqdn = format!("{}.", self.hostname);
        let out = self.runner.run(
            &argv(&[
                "aws",
                "route53",
                "list-resource-record-sets",
                "--hosted-zone-id",
                zone,
                "--output",
                "json",
            ]),
            &RunOpts::checked().capture(),
        )?;
        let parsed: Value = serde_json::from_str(&out.stdout)?;
        let sets = parsed["ResourceRecordSets"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let record = sets
            .iter()
            .find(|set| {
                set["Name"].as_str() == Some(fqdn.as_str()) && set["Type"].as_str() == Some("A")
            })
            .ok_or_else(|| Error::dns(format!("no A record for '{}'", self.hostname)))?;

        let ttl = record["TTL"].as_u64().unwrap_or(RECORD_TTL);
        let ip = record["ResourceRecords"][0]["Value"]
            .as_str()
            .ok_or_else(|| Error::dns(format!("A record for '{}' has no value", self.hostname)))?
            .to_string();
        Ok((ttl, ip))
    }

    /// Write the change batch and submit it
    fn submit(&self, zone: &str, action: &'static str, ttl: u64, ip: &str) -> Result<()> {
        let batch = ChangeBatch {
            changes: [Change {
                action,
                resource_record_set: RecordSet {
                    name: self.hostname.clone(),
                    record_type: "A",
                    ttl,
                    resource_records: vec![RecordValue {
                        value: ip.to_string(),
                    }],
                },
            }],
        };
        let path = self.workdir.join(CHANGESET_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&batch)?)?;

        let batch_arg = format!("file://{}", path.display());
        self.runner.run(
            &argv(&[
                "aws",
                "route53",
                "change-resource-record-sets",
                "--hosted-zone-id",
                zone,
                "--change-batch",
                &batch_arg,
                "--output",
                "json",
            ]),
            &RunOpts::checked().capture(),
        )?;
        Ok(())
    }
}
