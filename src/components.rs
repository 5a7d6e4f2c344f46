//! The static component list
//!
//! Components are enumerated, not discovered: each one owns a directory of
//! manifest templates in the checkout and a fixed position in the deploy
//! order. The order here is the template-rendering order; the orchestrator
//! owns the create/destroy step tables.

/// A named deployable unit of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// RabbitMQ-fed logstash collector (optional, logging group)
    LogstashRmq,
    /// Filebeat log shipper daemonset (optional, logging group)
    Filebeat,
    /// NFS fileserver backing the shared home volume
    Fileserver,
    /// Keep-alive pod that holds the NFS mount open
    FsKeepalive,
    /// Firefly visualization service (optional)
    Firefly,
    /// Image prepuller daemonset (optional)
    Prepuller,
    /// The notebook hub
    JupyterHub,
    /// TLS-terminating nginx ingress proxy
    Nginx,
}

impl Component {
    /// All components in their fixed enumeration order
    pub const ALL: [Component; 8] = [
        Component::LogstashRmq,
        Component::Filebeat,
        Component::Fileserver,
        Component::FsKeepalive,
        Component::Firefly,
        Component::Prepuller,
        Component::JupyterHub,
        Component::Nginx,
    ];

    /// Directory name under the template checkout and the working directory
    pub fn dir(&self) -> &'static str {
        match self {
            Component::LogstashRmq => "logstashrmq",
            Component::Filebeat => "filebeat",
            Component::Fileserver => "fileserver",
            Component::FsKeepalive => "fs-keepalive",
            Component::Firefly => "firefly",
            Component::Prepuller => "prepuller",
            Component::JupyterHub => "jupyterhub",
            Component::Nginx => "nginx",
        }
    }
}
