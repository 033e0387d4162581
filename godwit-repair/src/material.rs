//! Backup material: a compact sidecar recording schema SQL and per-table
//! leaf page numbers, enough to drive best-effort repair without trusting
//! interior b-tree nodes.
//!
//! Two generations are kept side by side (`<db>-first.material` and
//! `<db>-last.material`); writes alternate into the older slot so a crash
//! mid-write never loses the previous good generation.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bitcode::{Decode, Encode};
use godwit_result::{Error, FileOp, Result};

const MAGIC: &[u8; 4] = b"GWMT";
const FORMAT_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum ObjectKind {
    Table,
    Index,
    Trigger,
    View,
}

impl ObjectKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "table" => Some(ObjectKind::Table),
            "index" => Some(ObjectKind::Index),
            "trigger" => Some(ObjectKind::Trigger),
            "view" => Some(ObjectKind::View),
            _ => None,
        }
    }
}

/// One schema object captured in the material.
#[derive(Clone, Debug, Encode, Decode)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub name: String,
    pub sql: String,
    pub root_page: u32,
    /// Leaf pages of the object's b-tree; populated for tables only.
    pub leaf_pages: Vec<u32>,
}

/// The material for one database generation.
#[derive(Clone, Debug, Encode, Decode)]
pub struct Material {
    pub page_size: u32,
    pub objects: Vec<SchemaObject>,
}

impl Material {
    pub fn tables(&self) -> impl Iterator<Item = &SchemaObject> {
        self.objects
            .iter()
            .filter(|object| object.kind == ObjectKind::Table)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&bitcode::encode(self));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| Error::corrupt("bad material magic"))?;
        let (&version, payload) = payload
            .split_first()
            .ok_or_else(|| Error::corrupt("material truncated"))?;
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported material format version {version}"
            )));
        }
        bitcode::decode(payload).map_err(|err| Error::corrupt(format!("material decode: {err}")))
    }

    /// Write atomically: temporary file in the same directory, then rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, self.encode()).map_err(|err| Error::from(err).with_path(&tmp))?;
        fs::rename(&tmp, path).map_err(|err| Error::file(FileOp::Link, path, err))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| Error::from(err).with_path(path))?;
        Self::decode(&bytes).map_err(|err| err.with_path(path))
    }
}

fn suffixed(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// The two generation slots for a database path.
pub fn material_paths(db_path: &Path) -> (PathBuf, PathBuf) {
    (
        suffixed(db_path, "-first.material"),
        suffixed(db_path, "-last.material"),
    )
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Write the material into the older of the two slots.
pub fn write_rotating(db_path: &Path, material: &Material) -> Result<PathBuf> {
    let (first, last) = material_paths(db_path);
    let target = match (modified(&first), modified(&last)) {
        (None, _) => first,
        (_, None) => last,
        (Some(a), Some(b)) => {
            if a <= b {
                first
            } else {
                last
            }
        }
    };
    material.write_to(&target)?;
    Ok(target)
}

/// Read the freshest parseable generation, if any.
pub fn read_latest(db_path: &Path) -> Option<Material> {
    let (first, last) = material_paths(db_path);
    let mut slots = [(modified(&first), first), (modified(&last), last)];
    // Newest first; a slot that fails to parse falls back to the other.
    slots.sort_by(|a, b| b.0.cmp(&a.0));
    for (stamp, path) in slots {
        if stamp.is_none() {
            continue;
        }
        match Material::read_from(&path) {
            Ok(material) => return Some(material),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "ignoring unreadable material");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tag: &str) -> Material {
        Material {
            page_size: 4096,
            objects: vec![SchemaObject {
                kind: ObjectKind::Table,
                name: tag.to_string(),
                sql: format!("CREATE TABLE {tag} (x)"),
                root_page: 2,
                leaf_pages: vec![2, 7, 9],
            }],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let material = sample("t");
        let decoded = Material::decode(&material.encode()).unwrap();
        assert_eq!(decoded.objects[0].name, "t");
        assert_eq!(decoded.objects[0].leaf_pages, vec![2, 7, 9]);
        assert_eq!(decoded.page_size, 4096);
    }

    #[test]
    fn decode_rejects_foreign_bytes() {
        assert!(Material::decode(b"not material").is_err());
        assert!(Material::decode(b"GWMT\x63rest").is_err());
    }

    #[test]
    fn rotation_alternates_and_survives_a_bad_generation() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("x.db");
        let (first, last) = material_paths(&db);

        let slot_a = write_rotating(&db, &sample("a")).unwrap();
        assert_eq!(slot_a, first);
        // Ensure distinguishable mtimes on coarse-grained filesystems.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let slot_b = write_rotating(&db, &sample("b")).unwrap();
        assert_eq!(slot_b, last);

        assert_eq!(read_latest(&db).unwrap().objects[0].name, "b");

        // Clobber the newest generation; the older one must still load.
        std::fs::write(&last, b"garbage").unwrap();
        assert_eq!(read_latest(&db).unwrap().objects[0].name, "a");
    }
}
