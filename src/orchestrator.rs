//! Deployment and teardown sequencing
//!
//! The orchestrator owns the ordered step tables: which manifests are created
//! in which order on the way up, and which resources are deleted in reverse
//! on the way down. Every step runs through the injected [`CommandRunner`],
//! and every readiness discovery goes through [`wait_for`] with a budget
//! owned by [`PollBudgets`], so the whole sequence is testable without a
//! cluster.
//!
//! Teardown is tolerant by construction: deletes run with `check: false`
//! because a half-deployed stack is a normal teardown input. The two
//! exceptions are the pod-exit waits on a caller-owned cluster, where giving
//! up would leave someone else's cluster half-destroyed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::components::Component;
use crate::config;
use crate::dns::DnsManager;
use crate::error::Error;
use crate::kubecontext::{self, ContextScope};
use crate::params::{self, FeatureFlags, ParameterSet};
use crate::render::{self, TemplateRenderer};
use crate::repo;
use crate::runner::{argv, CommandRunner, RunOpts};
use crate::wait::wait_for;
use crate::Result;

/// One bounded-polling budget: a fixed delay and a try count
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    /// Sleep between tries
    pub delay: Duration,
    /// Attempts before giving up
    pub tries: u32,
}

/// The three polling budgets the sequences use.
///
/// Address assignment converges in seconds; a public load-balancer address
/// and pod termination can take minutes.
#[derive(Debug, Clone, Copy)]
pub struct PollBudgets {
    /// Cluster-internal service address assignment
    pub address: PollBudget,
    /// Public ingress address assignment
    pub ingress: PollBudget,
    /// Pod termination during teardown
    pub pod_exit: PollBudget,
}

impl Default for PollBudgets {
    fn default() -> Self {
        Self {
            address: PollBudget {
                delay: Duration::from_secs(10),
                tries: 10,
            },
            ingress: PollBudget {
                delay: Duration::from_secs(10),
                tries: 30,
            },
            pod_exit: PollBudget {
                delay: Duration::from_secs(10),
                tries: 60,
            },
        }
    }
}

/// Caller-facing knobs for one run
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Persistent working directory; a discarded scratch directory when unset
    pub directory: Option<PathBuf>,
    /// Stop after fetching and rendering the configuration
    pub config_only: bool,
    /// The cluster already exists and is not ours to create or delete
    pub existing_cluster: bool,
    /// The namespace already exists and is not ours to create or delete
    pub existing_namespace: bool,
    /// Deploy the image prepuller daemonset
    pub enable_prepuller: bool,
    /// Where the manifest templates come from
    pub repo_url: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            directory: None,
            config_only: false,
            existing_cluster: false,
            existing_namespace: false,
            enable_prepuller: true,
            repo_url: crate::TEMPLATE_REPO_URL.to_string(),
        }
    }
}

/// Drives a full stack deployment or teardown through a [`CommandRunner`]
pub struct StackDeployment<'a> {
    runner: &'a dyn CommandRunner,
    options: DeployOptions,
    budgets: PollBudgets,
}

impl<'a> StackDeployment<'a> {
    /// Create an orchestrator with the default polling budgets
    pub fn new(runner: &'a dyn CommandRunner, options: DeployOptions) -> Self {
        Self {
            runner,
            options,
            budgets: PollBudgets::default(),
        }
    }

    /// Override the polling budgets
    pub fn with_poll_budgets(mut self, budgets: PollBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    // =========================================================================
    // Deploy
    // =========================================================================

    /// Bring the whole stack up.
    ///
    /// Resolves parameters, assembles and renders the manifest set (skipped
    /// when the working directory already holds a `deployment/` tree), and
    /// unless `config_only` is set, creates every resource in dependency
    /// order and points the DNS record at the public address. The ambient
    /// kubectl context is saved before the first cluster operation and
    /// restored on every exit path.
    pub fn deploy(&self, raw: &mut ParameterSet) -> Result<()> {
        let flags = params::resolve_deploy(raw, self.runner)?;
        let (workdir, _scratch) = self.working_directory()?;

        let deployment = workdir.join(repo::DEPLOYMENT_DIR);
        if deployment.is_dir() {
            info!(dir = %deployment.display(), "reusing existing rendered configuration");
        } else {
            repo::fetch(&workdir, self.runner, &self.options.repo_url)?;
            let mut renderer = TemplateRenderer::new(raw);
            renderer.render_all(&deployment)?;
            render::rename_fileserver_template(&deployment)?;
            config::save_snapshot(&workdir, raw)?;
        }
        if self.options.config_only {
            info!("configuration generated, stopping before cluster work");
            return Ok(());
        }

        // Both pre-flight checks exist to fail before minutes of cluster
        // work: a logged-out gcloud and a hostname outside any hosted zone
        // would otherwise surface only deep into the sequence.
        self.check_gcloud_auth()?;
        let hostname = raw.get_str(params::HOSTNAME);
        let dns = DnsManager::new(self.runner, &hostname, &workdir);
        dns.zone_id()?;

        let scope = ContextScope::save(self.runner)?;
        let result = self.create_resources(raw, flags, &deployment, &dns);
        scope.restore(self.runner);
        result
    }

    fn create_resources(
        &self,
        params_set: &ParameterSet,
        flags: FeatureFlags,
        deployment: &Path,
        dns: &DnsManager,
    ) -> Result<()> {
        let cluster = params_set.get_str(params::KUBERNETES_CLUSTER_NAME);
        let namespace = params_set.get_str(params::KUBERNETES_CLUSTER_NAMESPACE);
        let zone = params_set.get_str(params::GKE_ZONE);

        if !self.options.existing_cluster {
            let machine = params_set.get_str(params::GKE_MACHINE_TYPE);
            let nodes = params_set.get_str(params::GKE_NODE_COUNT);
            info!(cluster = %cluster, zone = %zone, "creating cluster");
            self.runner.run(
                &argv(&[
                    "gcloud",
                    "container",
                    "clusters",
                    "create",
                    &cluster,
                    "--zone",
                    &zone,
                    "--machine-type",
                    &machine,
                    "--num-nodes",
                    &nodes,
                ]),
                &RunOpts::checked(),
            )?;
            self.runner.run(
                &argv(&[
                    "gcloud",
                    "container",
                    "clusters",
                    "get-credentials",
                    &cluster,
                    "--zone",
                    &zone,
                ]),
                &RunOpts::checked(),
            )?;
        }
        kubecontext::switch_to_cluster(self.runner, &cluster, &namespace)?;
        if namespace != "default" && !self.options.existing_namespace {
            self.runner.run(
                &argv(&["kubectl", "create", "namespace", &namespace]),
                &RunOpts::checked(),
            )?;
        }

        if flags.enable_logging {
            self.create_from(
                deployment,
                Component::LogstashRmq,
                &[
                    "nb-logstashrmq-secrets.yml",
                    "nb-logstashrmq-service.yml",
                    "nb-logstashrmq-deployment.yml",
                ],
            )?;
            self.create_from(
                deployment,
                Component::Filebeat,
                &["nb-filebeat-secrets.yml", "nb-filebeat-daemonset.yml"],
            )?;
        }

        self.create_from(
            deployment,
            Component::Fileserver,
            &[
                "nb-fileserver-storageclass.yml",
                "nb-fileserver-physpvc.yml",
                "nb-fileserver-service.yml",
                "nb-fileserver-deployment.yml",
            ],
        )?;
        let ip = self.wait_for_cluster_ip("nb-fileserver")?;
        info!(ip = %ip, "fileserver address assigned");
        let pv = render::render_fileserver_pv(deployment, &ip, &namespace)?;
        self.create_manifest(&pv)?;
        self.create_from(deployment, Component::Fileserver, &["nb-fileserver-pvc.yml"])?;

        self.create_from(
            deployment,
            Component::FsKeepalive,
            &["nb-keepalive-deployment.yml"],
        )?;

        if flags.enable_firefly {
            self.create_from(
                deployment,
                Component::Firefly,
                &[
                    "nb-firefly-secrets.yml",
                    "nb-firefly-service.yml",
                    "nb-firefly-deployment.yml",
                ],
            )?;
        }
        if self.options.enable_prepuller {
            self.create_from(
                deployment,
                Component::Prepuller,
                &["nb-prepuller-daemonset.yml"],
            )?;
        }

        self.create_from(
            deployment,
            Component::JupyterHub,
            &[
                "nb-hub-service.yml",
                "nb-hub-physpvc.yml",
                "nb-hub-secrets.yml",
            ],
        )?;
        self.create_hub_configmap(deployment)?;
        self.create_from(deployment, Component::JupyterHub, &["nb-hub-deployment.yml"])?;

        self.create_from(
            deployment,
            Component::Nginx,
            &[
                "tls-secrets.yml",
                "nb-nginx-service.yml",
                "nb-nginx-deployment.yml",
            ],
        )?;

        let public_ip = self.wait_for_ingress_ip("nb-nginx")?;
        info!(ip = %public_ip, "public address assigned");
        dns.upsert(&public_ip)
    }

    /// Fail on a logged-out gcloud.
    ///
    /// Only a successful `gcloud info` with an empty account is conclusive;
    /// a broken gcloud installation fails at its first real call instead.
    fn check_gcloud_auth(&self) -> Result<()> {
        let out = self.runner.run(
            &argv(&["gcloud", "info", "--format", "json"]),
            &RunOpts::probe(),
        )?;
        if !out.success {
            return Ok(());
        }
        let Ok(parsed) = serde_json::from_str::<Value>(&out.stdout) else {
            return Ok(());
        };
        let account = parsed
            .pointer("/config/account")
            .and_then(Value::as_str)
            .unwrap_or("");
        if account.is_empty() {
            return Err(Error::command_failed(
                "gcloud info",
                "gcloud not logged in; try 'gcloud init'",
            ));
        }
        info!(account = %account, "gcloud authenticated");
        Ok(())
    }

    /// The hub config is a directory of files, not a manifest
    fn create_hub_configmap(&self, deployment: &Path) -> Result<()> {
        let config_dir = deployment.join(Component::JupyterHub.dir()).join("config");
        self.runner.run(
            &[
                "kubectl".to_string(),
                "create".to_string(),
                "configmap".to_string(),
                "nb-hub-config".to_string(),
                format!("--from-file={}", config_dir.display()),
            ],
            &RunOpts::checked(),
        )?;
        Ok(())
    }

    fn create_from(&self, deployment: &Path, component: Component, files: &[&str]) -> Result<()> {
        for file in files {
            self.create_manifest(&deployment.join(component.dir()).join(file))?;
        }
        Ok(())
    }

    fn create_manifest(&self, path: &Path) -> Result<()> {
        self.runner.run(
            &[
                "kubectl".to_string(),
                "create".to_string(),
                "-f".to_string(),
                path.display().to_string(),
            ],
            &RunOpts::checked(),
        )?;
        Ok(())
    }

    // =========================================================================
    // Undeploy
    // =========================================================================

    /// Tear the stack down in reverse dependency order.
    ///
    /// The DNS record goes first and is best-effort; every resource delete
    /// tolerates absence. Pod-exit waits that time out are fatal only on a
    /// caller-owned cluster.
    pub fn undeploy(&self, raw: &mut ParameterSet) -> Result<()> {
        params::resolve_teardown(raw)?;
        let (workdir, _scratch) = self.working_directory()?;

        let scope = ContextScope::save(self.runner)?;
        let result = self.destroy_resources(raw, &workdir);
        scope.restore(self.runner);
        result
    }

    fn destroy_resources(&self, params_set: &ParameterSet, workdir: &Path) -> Result<()> {
        let cluster = params_set.get_str(params::KUBERNETES_CLUSTER_NAME);
        let namespace = params_set.get_str(params::KUBERNETES_CLUSTER_NAMESPACE);
        let hostname = params_set.get_str(params::HOSTNAME);

        kubecontext::switch_to_cluster(self.runner, &cluster, &namespace)?;

        let dns = DnsManager::new(self.runner, &hostname, workdir);
        if let Err(err) = dns.delete() {
            warn!(error = %err, "could not remove DNS record, continuing");
        }

        self.delete_resources(&[
            ("deployment", "nb-nginx"),
            ("service", "nb-nginx"),
            ("secret", "tls"),
        ])?;
        self.delete_resources(&[
            ("deployment", "nb-hub"),
            ("configmap", "nb-hub-config"),
            ("secret", "nb-hub"),
            ("pvc", "nb-hub-physpvc"),
            ("service", "nb-hub"),
        ])?;
        self.delete_resources(&[
            ("daemonset", "nb-prepuller"),
            ("deployment", "nb-firefly"),
            ("service", "nb-firefly"),
            ("secret", "nb-firefly"),
        ])?;

        self.delete_resources(&[("deployment", "nb-keepalive")])?;
        self.wait_for_pods_gone("nb-keepalive")?;

        let pv_name = format!("nb-fileserver-{namespace}");
        self.delete_resources(&[
            ("deployment", "nb-fileserver"),
            ("pvc", "nb-fileserver"),
            ("pv", &pv_name),
            ("service", "nb-fileserver"),
            ("pvc", "nb-fileserver-physpvc"),
            ("storageclass", "fast"),
        ])?;
        self.wait_for_pods_gone("nb-fileserver")?;

        self.delete_resources(&[
            ("daemonset", "nb-filebeat"),
            ("secret", "nb-filebeat"),
            ("deployment", "nb-logstashrmq"),
            ("service", "nb-logstashrmq"),
            ("secret", "nb-logstashrmq"),
        ])?;

        if namespace != "default" && !self.options.existing_namespace {
            // Point the context away from the namespace before removing it
            self.runner.run(
                &argv(&[
                    "kubectl",
                    "config",
                    "set-context",
                    "--current",
                    "--namespace",
                    "default",
                ]),
                &RunOpts::checked().tolerate_failure(),
            )?;
            self.delete_resources(&[("namespace", &namespace)])?;
        }

        if !self.options.existing_cluster {
            let zone = params_set.get_str(params::GKE_ZONE);
            info!(cluster = %cluster, "deleting cluster");
            self.runner.run(
                &argv(&[
                    "gcloud",
                    "-q",
                    "container",
                    "clusters",
                    "delete",
                    &cluster,
                    "--zone",
                    &zone,
                ]),
                &RunOpts::checked(),
            )?;
        }
        Ok(())
    }

    fn delete_resources(&self, resources: &[(&str, &str)]) -> Result<()> {
        for &(kind, name) in resources {
            self.runner.run(
                &argv(&["kubectl", "delete", kind, name]),
                &RunOpts::checked().tolerate_failure(),
            )?;
        }
        Ok(())
    }

    // =========================================================================
    // Probes
    // =========================================================================

    fn wait_for_cluster_ip(&self, service: &str) -> Result<String> {
        let budget = self.budgets.address;
        wait_for(
            &format!("{service} cluster address"),
            budget.delay,
            budget.tries,
            || self.service_field(service, "/spec/clusterIP"),
        )
    }

    fn wait_for_ingress_ip(&self, service: &str) -> Result<String> {
        let budget = self.budgets.ingress;
        wait_for(
            &format!("{service} public address"),
            budget.delay,
            budget.tries,
            || self.service_field(service, "/status/loadBalancer/ingress/0/ip"),
        )
    }

    /// One service status probe: absent service, unparsable output, and an
    /// unassigned field all mean "not ready yet"
    fn service_field(&self, service: &str, pointer: &str) -> Result<Option<String>> {
        let out = self.runner.run(
            &argv(&["kubectl", "get", "svc", service, "-o", "json"]),
            &RunOpts::probe(),
        )?;
        if !out.success {
            return Ok(None);
        }
        let Ok(parsed) = serde_json::from_str::<Value>(&out.stdout) else {
            return Ok(None);
        };
        Ok(parsed
            .pointer(pointer)
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .map(str::to_string))
    }

    /// Wait for every pod whose name starts with `prefix` to be gone.
    ///
    /// Times out fatally on a caller-owned cluster; otherwise the pending
    /// cluster deletion sweeps the pods up and a warning suffices.
    fn wait_for_pods_gone(&self, prefix: &str) -> Result<()> {
        let budget = self.budgets.pod_exit;
        let result = wait_for(
            &format!("{prefix} pods to exit"),
            budget.delay,
            budget.tries,
            || {
                let out = self.runner.run(
                    &argv(&["kubectl", "get", "pods", "-o", "json"]),
                    &RunOpts::probe(),
                )?;
                if !out.success {
                    return Ok(None);
                }
                let Ok(parsed) = serde_json::from_str::<Value>(&out.stdout) else {
                    return Ok(None);
                };
                let lingering = parsed["items"]
                    .as_array()
                    .map(|items| {
                        items.iter().any(|item| {
                            item.pointer("/metadata/name")
                                .and_then(Value::as_str)
                                .is_some_and(|name| name.starts_with(prefix))
                        })
                    })
                    .unwrap_or(false);
                Ok(if lingering { None } else { Some(()) })
            },
        );
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.options.existing_cluster => Err(err),
            Err(err) => {
                warn!(error = %err, "pods still running, cluster deletion will remove them");
                Ok(())
            }
        }
    }

    /// The working directory: the caller-supplied one, or a scratch directory
    /// that lives until the run ends
    fn working_directory(&self) -> Result<(PathBuf, Option<TempDir>)> {
        match &self.options.directory {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok((dir.clone(), None))
            }
            None => {
                let scratch = tempfile::tempdir()?;
                let path = scratch.path().to_path_buf();
                Ok((path, Some(scratch)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::error::Error;
    use crate::runner::CommandOutput;

    const ZONES: &str = r#"{"HostedZones": [
        {"Id": "/hostedzone/ZDEMO", "Name": "example.org."}
    ]}"#;

    const CONTEXTS: &str = "CURRENT   NAME                           CLUSTER   AUTHINFO\n\
                            *         minikube                       c0        u0\n\
                                      gke_proj_us-central1-a_demo    c1        u1\n";

    /// Fake platform: answers probes from a script, counts calls per probe so
    /// readiness can arrive on try k, and lays down the template repository
    /// tree when it sees `git clone`.
    struct FakePlatform {
        workdir: PathBuf,
        fileserver_ready_on: u32,
        pods_exit: bool,
        counts: Mutex<HashMap<&'static str, u32>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakePlatform {
        fn new(workdir: &Path) -> Self {
            Self {
                workdir: workdir.to_path_buf(),
                fileserver_ready_on: 3,
                pods_exit: true,
                counts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn bump(&self, key: &'static str) -> u32 {
            let mut counts = self.counts.lock().unwrap();
            let n = counts.entry(key).or_insert(0);
            *n += 1;
            *n
        }

        fn lay_down_repo(&self) {
            let repo = self.workdir.join("nbstack-manifests");
            for component in Component::ALL {
                let dir = repo.join(component.dir()).join("kubernetes");
                std::fs::create_dir_all(&dir).unwrap();
                let name = match component {
                    Component::Fileserver => "nb-fileserver-pv.template.yml".to_string(),
                    c => format!("nb-{}-secrets.template.yml", c.dir()),
                };
                let body = match component {
                    Component::Fileserver => "server: {{NFS_SERVER_IP_ADDRESS}}\n",
                    Component::JupyterHub => "clientId: {{GITHUB_CLIENT_ID}}\n",
                    _ => "host: {{HOSTNAME}}\n",
                };
                std::fs::write(dir.join(name), body).unwrap();
            }
        }

        fn ok(stdout: &str) -> CommandOutput {
            CommandOutput {
                success: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }
    }

    impl CommandRunner for FakePlatform {
        fn run(&self, argv: &[String], _opts: &RunOpts) -> crate::Result<CommandOutput> {
            let joined = argv.join(" ");
            self.calls.lock().unwrap().push(joined.clone());

            if joined.starts_with("git clone") {
                self.lay_down_repo();
                return Ok(Self::ok(""));
            }
            if joined.starts_with("gcloud info") {
                return Ok(Self::ok(r#"{"config": {"account": "ops@example.org"}}"#));
            }
            if joined.starts_with("kubectl config current-context") {
                return Ok(Self::ok("minikube\n"));
            }
            if joined.starts_with("kubectl config get-contexts") {
                return Ok(Self::ok(CONTEXTS));
            }
            if joined.starts_with("aws route53 list-hosted-zones") {
                return Ok(Self::ok(ZONES));
            }
            if joined.starts_with("aws route53 list-resource-record-sets") {
                return Ok(Self::ok(
                    r#"{"ResourceRecordSets": [
                        {"Name": "demo.example.org.", "Type": "A", "TTL": 60,
                         "ResourceRecords": [{"Value": "35.1.2.3"}]}
                    ]}"#,
                ));
            }
            if joined.starts_with("kubectl get svc nb-fileserver") {
                if self.bump("fileserver-svc") >= self.fileserver_ready_on {
                    return Ok(Self::ok(r#"{"spec": {"clusterIP": "10.0.0.5"}}"#));
                }
                return Ok(CommandOutput::default());
            }
            if joined.starts_with("kubectl get svc nb-nginx") {
                return Ok(Self::ok(
                    r#"{"status": {"loadBalancer": {"ingress": [{"ip": "35.1.2.3"}]}}}"#,
                ));
            }
            if joined.starts_with("kubectl get pods") {
                if self.pods_exit {
                    return Ok(Self::ok(r#"{"items": []}"#));
                }
                return Ok(Self::ok(
                    r#"{"items": [{"metadata": {"name": "nb-fileserver-abc12"}}]}"#,
                ));
            }
            Ok(Self::ok(""))
        }
    }

    fn zero_budgets() -> PollBudgets {
        PollBudgets {
            address: PollBudget {
                delay: Duration::ZERO,
                tries: 10,
            },
            ingress: PollBudget {
                delay: Duration::ZERO,
                tries: 30,
            },
            pod_exit: PollBudget {
                delay: Duration::ZERO,
                tries: 6,
            },
        }
    }

    fn deploy_params() -> ParameterSet {
        let mut p = ParameterSet::new();
        p.set(params::KUBERNETES_CLUSTER_NAME, "demo");
        p.set(params::KUBERNETES_CLUSTER_NAMESPACE, "nb");
        p.set(params::HOSTNAME, "demo.example.org");
        p.set(params::GITHUB_CLIENT_ID, "id123");
        p.set(params::GITHUB_CLIENT_SECRET, "sekrit");
        p.set(params::GITHUB_ORGANIZATION_WHITELIST, "org-one");
        p.set(params::TLS_CERT, "/nonexistent/cert.pem");
        p.set(params::TLS_KEY, "/nonexistent/key.pem");
        p.set(params::TLS_ROOT_CHAIN, "/nonexistent/chain.pem");
        // pre-resolved so no external generator runs
        p.set(params::DHPARAMS, "dhtext");
        p
    }

    /// A full deploy against the fake platform: templates fetched and
    /// rendered, the fileserver address discovered on the third probe, one
    /// DNS update for the public address.
    #[test]
    fn test_deploy_renders_and_creates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(dir.path());
        let orchestrator = StackDeployment::new(
            &platform,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        let mut params_set = deploy_params();
        orchestrator.deploy(&mut params_set).unwrap();

        // every component tree was rendered
        let deployment = dir.path().join("deployment");
        for component in Component::ALL {
            assert!(deployment.join(component.dir()).is_dir());
        }
        assert!(deployment
            .join("jupyterhub/nb-jupyterhub-secrets.yml")
            .exists());
        // the fileserver PV got its address on the narrow pass
        let pv = std::fs::read_to_string(deployment.join("fileserver/nb-fileserver-pv-nb.yml"))
            .unwrap();
        assert_eq!(pv, "server: 10.0.0.5\n");
        // snapshot written next to the deployment tree
        assert!(std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("deploy.")));

        let calls = platform.calls();
        let fileserver_probes = calls
            .iter()
            .filter(|c| c.starts_with("kubectl get svc nb-fileserver"))
            .count();
        assert_eq!(fileserver_probes, 3);

        let upserts: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("aws route53 change-resource-record-sets"))
            .collect();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].contains("--hosted-zone-id ZDEMO"));
        let changeset =
            std::fs::read_to_string(dir.path().join(crate::dns::CHANGESET_FILE)).unwrap();
        assert!(changeset.contains("UPSERT"));
        assert!(changeset.contains("35.1.2.3"));

        // cluster created before any manifest, namespace before the first create
        let cluster_pos = calls
            .iter()
            .position(|c| c.starts_with("gcloud container clusters create demo"))
            .unwrap();
        let first_manifest = calls
            .iter()
            .position(|c| c.starts_with("kubectl create -f"))
            .unwrap();
        assert!(cluster_pos < first_manifest);
        assert!(calls.iter().any(|c| c == "kubectl create namespace nb"));

        // ambient context restored at the end
        assert!(calls
            .last()
            .unwrap()
            .starts_with("kubectl config use-context minikube"));
    }

    #[test]
    fn test_config_only_stops_before_cluster_work() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(dir.path());
        let orchestrator = StackDeployment::new(
            &platform,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                config_only: true,
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        orchestrator.deploy(&mut deploy_params()).unwrap();

        assert!(dir.path().join("deployment/nginx").is_dir());
        let calls = platform.calls();
        assert!(calls.iter().all(|c| !c.starts_with("gcloud")));
        assert!(calls.iter().all(|c| !c.starts_with("kubectl create")));
    }

    #[test]
    fn test_existing_cluster_skips_gcloud() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(dir.path());
        let orchestrator = StackDeployment::new(
            &platform,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                existing_cluster: true,
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        orchestrator.deploy(&mut deploy_params()).unwrap();
        assert!(platform
            .calls()
            .iter()
            .all(|c| !c.starts_with("gcloud container")));
    }

    /// A logged-out gcloud is caught before any cluster work begins.
    #[test]
    fn test_deploy_fails_fast_when_gcloud_is_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(dir.path());
        struct LoggedOut<'a>(&'a FakePlatform);
        impl CommandRunner for LoggedOut<'_> {
            fn run(&self, argv: &[String], opts: &RunOpts) -> crate::Result<CommandOutput> {
                let joined = argv.join(" ");
                if joined.starts_with("gcloud info") {
                    self.0.calls.lock().unwrap().push(joined);
                    return Ok(FakePlatform::ok(r#"{"config": {"account": ""}}"#));
                }
                self.0.run(argv, opts)
            }
        }
        let runner = LoggedOut(&platform);
        let orchestrator = StackDeployment::new(
            &runner,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        let err = orchestrator.deploy(&mut deploy_params()).unwrap_err();
        assert!(err.to_string().contains("try 'gcloud init'"));
        let calls = platform.calls();
        assert!(calls.iter().all(|c| !c.starts_with("gcloud container")));
        assert!(calls.iter().all(|c| !c.starts_with("kubectl create")));
    }

    #[test]
    fn test_disabled_prepuller_is_never_created() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(dir.path());
        let orchestrator = StackDeployment::new(
            &platform,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                enable_prepuller: false,
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        orchestrator.deploy(&mut deploy_params()).unwrap();
        assert!(platform
            .calls()
            .iter()
            .all(|c| !c.contains("prepuller-daemonset")));
    }

    /// Teardown on our own cluster: pods linger past the budget, which is
    /// only a warning because the cluster delete removes them anyway.
    #[test]
    fn test_undeploy_tolerates_lingering_pods_on_own_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = FakePlatform::new(dir.path());
        platform.pods_exit = false;
        let orchestrator = StackDeployment::new(
            &platform,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        let mut params_set = deploy_params();
        orchestrator.undeploy(&mut params_set).unwrap();

        let calls = platform.calls();
        assert!(calls
            .iter()
            .any(|c| c.starts_with("gcloud -q container clusters delete demo")));
        // DNS removal attempted before the resource deletes
        let dns_pos = calls
            .iter()
            .position(|c| c.starts_with("aws route53 change-resource-record-sets"))
            .unwrap();
        let first_delete = calls
            .iter()
            .position(|c| c.starts_with("kubectl delete"))
            .unwrap();
        assert!(dns_pos < first_delete);
        // nginx goes before the fileserver
        let nginx = calls
            .iter()
            .position(|c| c == "kubectl delete deployment nb-nginx")
            .unwrap();
        let fileserver = calls
            .iter()
            .position(|c| c == "kubectl delete deployment nb-fileserver")
            .unwrap();
        assert!(nginx < fileserver);
        // namespace removed after pointing the context elsewhere
        assert!(calls.iter().any(|c| c == "kubectl delete namespace nb"));
    }

    /// On a caller-owned cluster nothing sweeps lingering pods up, so the
    /// exhausted wait is an error.
    #[test]
    fn test_undeploy_existing_cluster_fails_when_pods_never_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = FakePlatform::new(dir.path());
        platform.pods_exit = false;
        let orchestrator = StackDeployment::new(
            &platform,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                existing_cluster: true,
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        let err = orchestrator.undeploy(&mut deploy_params()).unwrap_err();
        assert!(matches!(err, Error::PollTimeout { .. }));
        // no cluster delete was attempted
        assert!(platform.calls().iter().all(|c| !c.starts_with("gcloud")));
        // the ambient context was still restored
        assert!(platform
            .calls()
            .last()
            .unwrap()
            .starts_with("kubectl config use-context minikube"));
    }

    #[test]
    fn test_undeploy_swallows_missing_dns_record() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(dir.path());
        // Answer the record listing with an empty zone
        struct NoRecord<'a>(&'a FakePlatform);
        impl CommandRunner for NoRecord<'_> {
            fn run(&self, argv: &[String], opts: &RunOpts) -> crate::Result<CommandOutput> {
                let joined = argv.join(" ");
                if joined.starts_with("aws route53 list-resource-record-sets") {
                    self.0.calls.lock().unwrap().push(joined);
                    return Ok(FakePlatform::ok(r#"{"ResourceRecordSets": []}"#));
                }
                self.0.run(argv, opts)
            }
        }
        let runner = NoRecord(&platform);
        let orchestrator = StackDeployment::new(
            &runner,
            DeployOptions {
                directory: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .with_poll_budgets(zero_budgets());

        orchestrator.undeploy(&mut deploy_params()).unwrap();
        let calls = platform.calls();
        // no change batch submitted, teardown carried on to the cluster
        assert!(calls
            .iter()
            .all(|c| !c.starts_with("aws route53 change-resource-record-sets")));
        assert!(calls
            .iter()
            .any(|c| c.starts_with("gcloud -q container clusters delete")));
    }
}
