//! Shared fakes and fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use esxi_core::config::{PollPolicy, RetryPolicy};
use esxi_core::http::{HttpBackend, HttpRequest, HttpResponse};
use esxi_core::soap::{parse_element, Transport, XmlNode};
use esxi_core::{Error, Esxi, EsxiConfig, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;

pub const HOST: &str = "esxi.test";

type Override = Box<dyn FnMut(&[XmlNode]) -> Result<XmlNode> + Send>;

/// Parse a response document for a fake.
pub fn xml(document: &str) -> XmlNode {
    parse_element(document).expect("Failed to parse fixture XML")
}

/// An in-memory ESXi API.
///
/// Answers the session handshake and property collector calls from object
/// fixtures; any method can be overridden.
pub struct FakeTransport {
    pub calls: Arc<Mutex<Vec<String>>>,
    pages: HashMap<String, Vec<String>>,
    overrides: Mutex<HashMap<String, Override>>,
}

impl FakeTransport {
    /// A host with one datacenter and nothing else.
    pub fn new() -> Self {
        let mut transport = Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            pages: HashMap::new(),
            overrides: Mutex::new(HashMap::new()),
        };
        transport.set_pages(
            "Datacenter",
            vec![object("Datacenter", "ha-datacenter", &[("name", "<val xsi:type=\"xsd:string\">ha-datacenter</val>")])],
        );
        transport
    }

    /// Serve `pages` of `objects` XML for enumerations of `object_type`.
    pub fn set_pages(&mut self, object_type: &str, pages: Vec<String>) {
        self.pages.insert(object_type.to_string(), pages);
    }

    /// Serve all `objects` of `object_type` on a single page.
    pub fn with_objects(mut self, object_type: &str, objects: Vec<String>) -> Self {
        self.set_pages(object_type, vec![objects.concat()]);
        self
    }

    /// Replace the answer to `method`.
    pub fn with_override<F>(self, method: &str, handler: F) -> Self
    where
        F: FnMut(&[XmlNode]) -> Result<XmlNode> + Send + 'static,
    {
        self.overrides
            .lock()
            .unwrap()
            .insert(method.to_string(), Box::new(handler));
        self
    }

    pub fn calls_to(calls: &Arc<Mutex<Vec<String>>>, method: &str) -> usize {
        calls.lock().unwrap().iter().filter(|c| *c == method).count()
    }

    fn page(&self, object_type: &str, index: usize) -> XmlNode {
        let pages = self.pages.get(object_type).cloned().unwrap_or_default();
        let objects = pages.get(index).cloned().unwrap_or_default();
        let token = if index + 1 < pages.len() {
            format!("<token>{}#{}</token>", object_type, index + 1)
        } else {
            String::new()
        };
        if pages.is_empty() {
            return xml("<RetrievePropertiesExResponse/>");
        }
        xml(&format!(
            "<RetrievePropertiesExResponse><returnval>{}{}</returnval></RetrievePropertiesExResponse>",
            token, objects
        ))
    }
}

impl Transport for FakeTransport {
    fn call(&self, method: &str, args: &[XmlNode]) -> Result<XmlNode> {
        self.calls.lock().unwrap().push(method.to_string());

        if let Some(handler) = self.overrides.lock().unwrap().get_mut(method) {
            return handler(args);
        }

        Ok(match method {
            "RetrieveServiceContent" => xml(
                r#"<RetrieveServiceContentResponse><returnval>
                     <rootFolder type="Folder">ha-folder-root</rootFolder>
                     <propertyCollector type="PropertyCollector">ha-property-collector</propertyCollector>
                     <viewManager type="ViewManager">ViewManager</viewManager>
                     <sessionManager type="SessionManager">ha-sessionmgr</sessionManager>
                   </returnval></RetrieveServiceContentResponse>"#,
            ),
            "Login" => xml("<LoginResponse><returnval><key>52a9</key></returnval></LoginResponse>"),
            "CreateContainerView" => {
                let object_type = args[2].text.clone();
                xml(&format!(
                    "<CreateContainerViewResponse><returnval type=\"ContainerView\">view-{}</returnval></CreateContainerViewResponse>",
                    object_type
                ))
            }
            "DestroyView" => xml("<DestroyViewResponse/>"),
            "RetrievePropertiesEx" => {
                let object_type = args[1]
                    .text_at(&["propSet", "type"])
                    .unwrap_or_default()
                    .to_string();
                self.page(&object_type, 0)
            }
            "ContinueRetrievePropertiesEx" => {
                let token = args[1].text.clone();
                let (object_type, index) = token.split_once('#').expect("token has a page index");
                self.page(object_type, index.parse().expect("page index"))
            }
            other => {
                return Err(Error::Rpc {
                    method: other.to_string(),
                    fault: "not implemented by fake".to_string(),
                })
            }
        })
    }

    fn session_cookie(&self) -> Option<String> {
        Some("vmware_soap_session=\"fake\"".to_string())
    }
}

/// One `objects` element of a property collector page.
pub fn object(kind: &str, id: &str, props: &[(&str, &str)]) -> String {
    let props: String = props
        .iter()
        .map(|(name, val)| format!("<propSet><name>{}</name>{}</propSet>", name, val))
        .collect();
    format!("<objects><obj type=\"{}\">{}</obj>{}</objects>", kind, id, props)
}

/// A `VirtualMachine` with the properties the metadata assembler reads.
pub fn vm_object(id: &str, name: &str, vm_path_name: &str, usage: &[(u64, u64)]) -> String {
    let usage: String = usage
        .iter()
        .map(|(committed, uncommitted)| {
            format!(
                "<perDatastoreUsage><datastore type=\"Datastore\">datastore-1</datastore>\
                 <committed>{}</committed><uncommitted>{}</uncommitted><unshared>0</unshared></perDatastoreUsage>",
                committed, uncommitted
            )
        })
        .collect();
    object(
        "VirtualMachine",
        id,
        &[
            ("name", &format!("<val xsi:type=\"xsd:string\">{}</val>", name)),
            (
                "config",
                &format!(
                    "<val xsi:type=\"VirtualMachineConfigInfo\"><name>{}</name><firmware>efi</firmware>\
                     <hardware><numCPU>2</numCPU><memoryMB>2048</memoryMB></hardware>\
                     <files><vmPathName>{}</vmPathName></files></val>",
                    name, vm_path_name
                ),
            ),
            (
                "storage",
                &format!(
                    "<val xsi:type=\"VirtualMachineStorageInfo\">{}<timestamp>2024-01-01T00:00:00Z</timestamp></val>",
                    usage
                ),
            ),
            (
                "runtime",
                "<val xsi:type=\"VirtualMachineRuntimeInfo\"><powerState>poweredOff</powerState></val>",
            ),
        ],
    )
}

/// A `Datastore` with its summary.
pub fn datastore_object(id: &str, name: &str, url: &str) -> String {
    object(
        "Datastore",
        id,
        &[(
            "summary",
            &format!(
                "<val xsi:type=\"DatastoreSummary\"><name>{}</name><url>{}</url><type>VMFS</type></val>",
                name, url
            ),
        )],
    )
}

type Handler = Box<dyn Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync>;

/// An in-memory datastore browser.
pub struct FakeBackend {
    pub requests: Arc<Mutex<Vec<HttpRequest>>>,
    handler: Handler,
}

impl FakeBackend {
    /// Answer every request with `handler(request, attempt_index)`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            handler: Box::new(handler),
        }
    }

    /// Serve `files`, keyed by `<datastore>/<path>`, honouring ranges.
    pub fn files(files: HashMap<String, Vec<u8>>) -> Self {
        Self::new(move |request, _| {
            let url = reqwest::Url::parse(&request.url).expect("valid url");
            let ds = url
                .query_pairs()
                .find(|(k, _)| k == "dsName")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let path = url.path().trim_start_matches("/folder/");
            let path = percent_decode(path);
            let Some(data) = files.get(&format!("{}/{}", ds, path)) else {
                return Ok(HttpResponse::from_bytes(404, b"Not Found".to_vec()));
            };
            match request.range {
                None => Ok(HttpResponse::from_bytes(200, data.clone())),
                Some(range) => {
                    let end = (range.end as usize).min(data.len() - 1);
                    let body = data[range.start as usize..=end].to_vec();
                    Ok(HttpResponse::from_bytes(206, body).with_content_range(format!(
                        "bytes {}-{}/{}",
                        range.start,
                        end,
                        data.len()
                    )))
                }
            }
        })
    }

    pub fn count(requests: &Arc<Mutex<Vec<HttpRequest>>>) -> usize {
        requests.lock().unwrap().len()
    }
}

impl HttpBackend for FakeBackend {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let attempt = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        (self.handler)(request, attempt)
    }
}

fn percent_decode(path: &str) -> String {
    path.replace("%20", " ")
}

/// Configuration with instant retries and polls.
pub fn fast_config() -> EsxiConfig {
    EsxiConfig::new(HOST, "root", "secret", false)
        .with_retry(RetryPolicy::new(5, Duration::from_millis(1)))
        .with_poll(PollPolicy::new(10, Duration::from_millis(1)))
}

/// A connected client over the fakes.
pub fn connected(transport: FakeTransport, backend: FakeBackend) -> Esxi<FakeTransport, FakeBackend> {
    let esxi = Esxi::with_parts(fast_config(), transport, backend);
    esxi.connect().expect("Failed to connect to fake host");
    esxi
}

/// Builds stream-optimized VMDK images.
///
/// Grains are written first, then the grain tables, the grain directory, and
/// the footer, mirroring how a streaming writer lays them out.
pub struct StreamVmdkBuilder {
    capacity: u64,
    grain_sectors: u64,
    gtes: u32,
    grains: BTreeMap<u64, Vec<u8>>,
}

pub const GRAIN: usize = 64 * 1024;

impl StreamVmdkBuilder {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes / 512,
            grain_sectors: 128,
            gtes: 512,
            grains: BTreeMap::new(),
        }
    }

    /// Store `data` (one grain) at grain `index`, compressed with zlib.
    pub fn grain(self, index: u64, data: &[u8]) -> Self {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).expect("Failed to compress grain");
        let compressed = encoder.finish().expect("Failed to finish grain");
        self.raw_grain(index, compressed)
    }

    /// Store an already compressed payload at grain `index`.
    pub fn raw_grain(mut self, index: u64, payload: Vec<u8>) -> Self {
        self.grains.insert(index, payload);
        self
    }

    fn header(&self, gd_offset: u64) -> Vec<u8> {
        let mut h = vec![0u8; 512];
        h[0..4].copy_from_slice(&0x564D444Bu32.to_le_bytes());
        h[4..8].copy_from_slice(&3u32.to_le_bytes());
        h[8..12].copy_from_slice(&(1u32 | (1 << 16) | (1 << 17)).to_le_bytes());
        h[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        h[20..28].copy_from_slice(&self.grain_sectors.to_le_bytes());
        h[44..48].copy_from_slice(&self.gtes.to_le_bytes());
        h[56..64].copy_from_slice(&gd_offset.to_le_bytes());
        h[73..77].copy_from_slice(&[b'\n', b' ', b'\r', b'\n']);
        h[77..79].copy_from_slice(&1u16.to_le_bytes());
        h
    }

    fn marker(kind: u32, sectors: u64) -> Vec<u8> {
        let mut m = vec![0u8; 512];
        m[0..8].copy_from_slice(&sectors.to_le_bytes());
        m[12..16].copy_from_slice(&kind.to_le_bytes());
        m
    }

    fn pad(out: &mut Vec<u8>) {
        let rem = out.len() % 512;
        if rem != 0 {
            out.resize(out.len() + 512 - rem, 0);
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.header(u64::MAX);
        let gtes = self.gtes as u64;
        let slot = self.grain_sectors * gtes;
        let gd_entries = self.capacity.div_ceil(slot) as usize;

        let mut tables: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (&index, payload) in &self.grains {
            let sector = (out.len() / 512) as u32;
            out.extend_from_slice(&(index * self.grain_sectors).to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
            Self::pad(&mut out);
            tables
                .entry(index / gtes)
                .or_insert_with(|| vec![0; self.gtes as usize])[(index % gtes) as usize] = sector;
        }

        let mut directory = vec![0u32; gd_entries];
        let table_sectors = (gtes * 4).div_ceil(512);
        for (gt, entries) in &tables {
            out.extend_from_slice(&Self::marker(1, table_sectors));
            directory[*gt as usize] = (out.len() / 512) as u32;
            for entry in entries {
                out.extend_from_slice(&entry.to_le_bytes());
            }
            Self::pad(&mut out);
        }

        out.extend_from_slice(&Self::marker(2, (gd_entries as u64 * 4).div_ceil(512)));
        let gd_offset = (out.len() / 512) as u64;
        for entry in &directory {
            out.extend_from_slice(&entry.to_le_bytes());
        }
        Self::pad(&mut out);

        out.extend_from_slice(&Self::marker(3, 1));
        out.extend_from_slice(&self.header(gd_offset));
        out.extend_from_slice(&Self::marker(0, 0));
        out
    }
}

/// A grain filled with `byte`.
pub fn grain_of(byte: u8) -> Vec<u8> {
    vec![byte; GRAIN]
}
