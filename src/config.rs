// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory exported as the object namespace; made absolute at mount.
    #[serde(default = "default_root")]
    pub root: String,

    /// Floor of discounted free bytes below which puts are refused.
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    /// Floor of free inodes below which puts are refused (where the
    /// filesystem reports a real inode total).
    #[serde(default = "default_min_free_inodes")]
    pub min_free_inodes: u64,

    /// Skip the statvfs probe entirely; hosts where it is prohibitively
    /// slow are treated as always admissible.
    #[serde(default)]
    pub skip_disk_checks: bool,

    /// Filesystem types whose inode counters are meaningless and exempt
    /// from the inode floor.
    #[serde(default = "default_inode_exempt")]
    pub inode_check_exempt_fstypes: Vec<String>,

    #[serde(default)]
    pub io: IoConfig,

    #[serde(default)]
    pub list: ListConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
    /// Buffer size for object reads in bytes; capped per request at the
    /// requested length.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Buffer size for staged object writes in bytes; capped per request
    /// at the declared content length.
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListConfig {
    /// Idle seconds before a parked tree-walker is cancelled and evicted.
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
    /// Hard cap on the page size of a single ListObjects call.
    #[serde(default = "default_max_object_list")]
    pub max_object_list: usize,
    /// Bound on simultaneously parked walkers; oldest evicted first.
    #[serde(default = "default_max_parked_walkers")]
    pub max_parked_walkers: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            min_free_space: default_min_free_space(),
            min_free_inodes: default_min_free_inodes(),
            skip_disk_checks: false,
            inode_check_exempt_fstypes: default_inode_exempt(),
            io: IoConfig::default(),
            list: ListConfig::default(),
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_secs: default_lookup_timeout_secs(),
            max_object_list: default_max_object_list(),
            max_parked_walkers: default_max_parked_walkers(),
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}

fn default_root() -> String {
    "./data".to_string()
}

fn default_min_free_space() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_min_free_inodes() -> u64 {
    10_000
}

fn default_inode_exempt() -> Vec<String> {
    vec!["nfs".to_string()]
}

fn default_read_buffer_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_write_buffer_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_lookup_timeout_secs() -> u64 {
    15
}

fn default_max_object_list() -> usize {
    1000
}

fn default_max_parked_walkers() -> usize {
    64
}
