use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scanfleet_common::config::WorkerConfig;
use scanfleet_common::job::{ImportMode, Job};
use scanfleet_core::ledger::{LedgerError, ScanLedger};
use scanfleet_core::pipeline::Pipeline;
use scanfleet_core::store::InMemoryStore;
use scanfleet_report::NmapXmlParser;
use tempfile::TempDir;
use uuid::Uuid;

pub const TARGET: &str = "10.0.0.5";
pub const HOSTNAME: &str = "db1.internal";

pub const DISCOVERY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -p- --open 10.0.0.5" start="1700000000" version="7.94">
<host starttime="1700000001" endtime="1700000009"><status state="up" reason="echo-reply"/>
<address addr="10.0.0.5" addrtype="ipv4"/>
<hostnames>
<hostname name="host-10-0-0-5.lan" type="PTR"/>
</hostnames>
<ports><extraports state="closed" count="65533"/>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" method="table" conf="3"/></port>
<port protocol="tcp" portid="443"><state state="open" reason="syn-ack"/><service name="https" method="table" conf="3"/></port>
</ports>
</host>
<runstats><finished time="1700000009" exit="success"/><hosts up="1" down="0" total="1"/></runstats>
</nmaprun>
"#;

pub const ENRICHMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -p 22,443 -sV -Pn -T4 10.0.0.5" start="1700000010" version="7.94">
<host><status state="up" reason="user-set"/>
<address addr="10.0.0.5" addrtype="ipv4"/>
<hostnames>
</hostnames>
<ports>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" product="OpenSSH" version="9.6p1" method="probed" conf="10"/></port>
<port protocol="tcp" portid="443"><state state="open" reason="syn-ack"/><service name="http" product="nginx" tunnel="ssl" method="probed" conf="10"/><script id="http-title" output="Welcome"/></port>
</ports>
</host>
<runstats><finished time="1700000020" exit="success"/><hosts up="1" down="0" total="1"/></runstats>
</nmaprun>
"#;

pub const NO_PORTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -p- --open 10.0.0.5" start="1700000000" version="7.94">
<host><status state="up" reason="echo-reply"/>
<address addr="10.0.0.5" addrtype="ipv4"/>
<hostnames>
</hostnames>
<ports><extraports state="closed" count="65535"/>
</ports>
</host>
<runstats><finished time="1700000009" exit="success"/><hosts up="1" down="0" total="1"/></runstats>
</nmaprun>
"#;

pub const HOST_DOWN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -p- --open 10.0.0.5" start="1700000000" version="7.94">
<runstats><finished time="1700000003" exit="success"/><hosts up="0" down="1" total="1"/></runstats>
</nmaprun>
"#;

/// A shell script standing in for the scan tool.
///
/// It logs its arguments, then copies the discovery fixture (or the enrichment
/// fixture when called with `-sV`) to the path following `-oX`.
pub struct FakeScanner {
    dir: TempDir,
}

impl FakeScanner {
    pub fn new(discovery: &str, enrichment: Option<&str>) -> Self {
        Self::build(discovery, enrichment, 0)
    }

    /// Sleeps `delay_secs` before writing its report.
    pub fn slow(discovery: &str, delay_secs: u64) -> Self {
        Self::build(discovery, None, delay_secs)
    }

    /// Never writes a report; runs until signalled.
    pub fn hanging() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.log");
        let script = format!("echo \"$*\" >> \"{}\"\nexec sleep 30\n", log.display());
        std::fs::write(dir.path().join("fake-scan.sh"), script).unwrap();
        Self { dir }
    }

    fn build(discovery: &str, enrichment: Option<&str>, delay_secs: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let discovery_path: PathBuf = dir.path().join("discovery.xml");
        let enrichment_path: PathBuf = dir.path().join("enrichment.xml");
        std::fs::write(&discovery_path, discovery).unwrap();
        if let Some(enrichment) = enrichment {
            std::fs::write(&enrichment_path, enrichment).unwrap();
        }

        let script = format!(
            r#"echo "$*" >> "{log}"
fixture="{discovery}"
for arg in "$@"; do
  if [ "$arg" = "-sV" ]; then fixture="{enrichment}"; fi
done
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-oX" ]; then out="$2"; shift; fi
  shift
done
sleep {delay_secs}
cat "$fixture" > "$out"
"#,
            log = dir.path().join("args.log").display(),
            discovery = discovery_path.display(),
            enrichment = enrichment_path.display(),
        );
        std::fs::write(dir.path().join("fake-scan.sh"), script).unwrap();
        Self { dir }
    }

    pub fn command(&self) -> String {
        format!("sh {}", self.dir.path().join("fake-scan.sh").display())
    }

    /// Argument lists of every invocation so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("args.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub project: Uuid,
    pub report: String,
    pub mode: ImportMode,
}

#[derive(Default)]
pub struct RecordingLedger {
    uploads: Mutex<Vec<Upload>>,
    empties: Mutex<Vec<(Uuid, IpAddr, ImportMode)>>,
}

impl RecordingLedger {
    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn empties(&self) -> Vec<(Uuid, IpAddr, ImportMode)> {
        self.empties.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanLedger for RecordingLedger {
    async fn upload(&self, project: &Uuid, report: &str, mode: ImportMode) -> Result<(), LedgerError> {
        self.uploads.lock().unwrap().push(Upload {
            project: *project,
            report: report.to_string(),
            mode,
        });
        Ok(())
    }

    async fn create_empty(&self, project: &Uuid, ip: &IpAddr, mode: ImportMode) -> Result<(), LedgerError> {
        self.empties.lock().unwrap().push((*project, *ip, mode));
        Ok(())
    }
}

pub fn job(include_enrichment: bool, mode: ImportMode) -> Job {
    Job {
        id: Uuid::new_v4().to_string(),
        ip: TARGET.parse().unwrap(),
        hostnames: vec![HOSTNAME.to_string()],
        project: Uuid::new_v4(),
        user: "alice".to_string(),
        discovery_opts: "-p- --open".to_string(),
        enrichment_opts: "-sV -Pn -T4".to_string(),
        timeout_secs: 30,
        include_enrichment,
        mode,
    }
}

pub fn config(worker: &str, scanner: &FakeScanner) -> WorkerConfig {
    WorkerConfig {
        hostname: worker.to_string(),
        scan_command: scanner.command(),
        terminate_grace: Duration::from_millis(500),
        queue_poll: Duration::from_millis(20),
        ..WorkerConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub ledger: Arc<RecordingLedger>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new(config: WorkerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new("nmap"));
        let ledger = Arc::new(RecordingLedger::default());
        let pipeline = Pipeline::new(
            Arc::new(config),
            store.clone(),
            ledger.clone(),
            Arc::new(NmapXmlParser),
        )
        .unwrap();
        Self {
            store,
            ledger,
            pipeline,
        }
    }
}
