use crate::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSource {
    Powershell,
    ScQuery,
}

impl ServiceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceSource::Powershell => "powershell",
            ServiceSource::ScQuery => "sc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    pub status: String,
    pub source: ServiceSource,
}

#[cfg(windows)]
pub fn query_service(name: &str) -> Result<ServiceStatus, HostError> {
    use crate::tools::run_tool;
    use std::time::Duration;

    let script = format!("(Get-Service '{}' -ErrorAction Stop).Status", name);
    let ps = run_tool(
        "powershell",
        &["-NoProfile", "-Command", &script],
        Duration::from_secs(5),
    );
    let status = ps.stdout.trim();
    if ps.ok() && !status.is_empty() {
        return Ok(ServiceStatus {
            running: status.eq_ignore_ascii_case("running"),
            status: status.to_string(),
            source: ServiceSource::Powershell,
        });
    }

    let sc = run_tool("sc", &["query", name], Duration::from_secs(5));
    if sc.ok() && !sc.stdout.trim().is_empty() {
        let text = sc.stdout.trim().to_string();
        return Ok(ServiceStatus {
            running: text.to_ascii_uppercase().contains("RUNNING"),
            status: text,
            source: ServiceSource::ScQuery,
        });
    }
    let error = if sc.stderr.trim().is_empty() {
        format!("exit code {}", sc.code)
    } else {
        sc.stderr.trim().to_string()
    };
    Err(HostError::Query(error))
}

#[cfg(not(windows))]
pub fn query_service(_name: &str) -> Result<ServiceStatus, HostError> {
    Err(HostError::Unsupported("service query requires Windows"))
}
