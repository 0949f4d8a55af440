//! PIC32 variant table: device ID code to name, flash size and family.
//!
//! The static table can be extended (or patched) at run time from a RON
//! file, so new silicon is usable without recompiling.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::family::{self, Family};

/// Matching ignores the top four ID bits, which carry the silicon
/// revision.
pub const DEVID_MASK: u32 = 0x0fff_ffff;

/// One table entry.
#[derive(Debug, Clone)]
pub struct Variant {
    /// Device identification code (revision bits included as shipped).
    pub devid: u32,
    /// Marketing name, without the PIC32 prefix.
    pub name: String,
    /// Program flash size in kilobytes.
    pub flash_kbytes: u32,
    /// Family descriptor.
    pub family: &'static Family,
}

fn entry(devid: u32, name: &str, flash_kbytes: u32, family: &'static Family) -> Variant {
    Variant {
        devid,
        name: name.to_string(),
        flash_kbytes,
        family,
    }
}

/// Entry shape of the RON extension file.
#[derive(Debug, Deserialize)]
struct VariantDef {
    name: String,
    id: u32,
    family: String,
    flash_kbytes: u32,
}

/// The runtime device table.
pub struct DeviceTable {
    entries: Vec<Variant>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    /// Build the built-in table.
    pub fn new() -> Self {
        DeviceTable {
            entries: builtin_table(),
        }
    }

    /// Number of known variants.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty (it never is in practice).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the variant for a probed ID code, ignoring revision bits.
    pub fn lookup(&self, idcode: u32) -> Option<&Variant> {
        self.entries
            .iter()
            .find(|v| (v.devid ^ idcode) & DEVID_MASK == 0)
    }

    /// Merge entries from a RON extension file. An entry whose ID is
    /// already known replaces the built-in data.
    pub fn extend_from_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        let defs: Vec<VariantDef> = ron::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let count = defs.len();
        for def in defs {
            let family = Family::by_name(&def.family).ok_or_else(|| {
                Error::Config(format!("{}: unknown family {}", def.name, def.family))
            })?;
            let variant = Variant {
                devid: def.id,
                name: def.name,
                flash_kbytes: def.flash_kbytes,
                family,
            };
            match self
                .entries
                .iter_mut()
                .find(|v| (v.devid ^ variant.devid) & DEVID_MASK == 0)
            {
                Some(existing) => *existing = variant,
                None => self.entries.push(variant),
            }
        }
        Ok(count)
    }
}

fn builtin_table() -> Vec<Variant> {
    vec![
    entry(0x4A07053, "MX110F016B", 16, &family::MX1),
    entry(0x4A09053, "MX110F016C", 16, &family::MX1),
    entry(0x4A0B053, "MX110F016D", 16, &family::MX1),
    entry(0x4A06053, "MX120F032B", 32, &family::MX1),
    entry(0x4A08053, "MX120F032C", 32, &family::MX1),
    entry(0x4A0A053, "MX120F032D", 32, &family::MX1),
    entry(0x6A50053, "MX120F064H", 64, &family::MX1),
    entry(0x4D07053, "MX130F064B", 64, &family::MX1),
    entry(0x4D09053, "MX130F064C", 64, &family::MX1),
    entry(0x4D0B053, "MX130F064D", 64, &family::MX1),
    entry(0x6A00053, "MX130F128H", 128, &family::MX1),
    entry(0x6A01053, "MX130F128L", 128, &family::MX1),
    entry(0x4D06053, "MX150F128B", 128, &family::MX1),
    entry(0x4D08053, "MX150F128C", 128, &family::MX1),
    entry(0x4D0A053, "MX150F128D", 128, &family::MX1),
    entry(0x6A10053, "MX150F256H", 256, &family::MX1),
    entry(0x6A11053, "MX150F256L", 256, &family::MX1),
    entry(0x6610053, "MX170F256B", 256, &family::MX1),
    entry(0x661A053, "MX170F256D", 256, &family::MX1),
    entry(0x6A30053, "MX170F512H", 512, &family::MX1),
    entry(0x6A31053, "MX170F512L", 512, &family::MX1),
    entry(0x4A01053, "MX210F016B", 16, &family::MX1),
    entry(0x4A03053, "MX210F016C", 16, &family::MX1),
    entry(0x4A05053, "MX210F016D", 16, &family::MX1),
    entry(0x4A00053, "MX220F032B", 32, &family::MX1),
    entry(0x4A02053, "MX220F032C", 32, &family::MX1),
    entry(0x4A04053, "MX220F032D", 32, &family::MX1),
    entry(0x4D01053, "MX230F064B", 64, &family::MX1),
    entry(0x4D03053, "MX230F064C", 64, &family::MX1),
    entry(0x4D05053, "MX230F064D", 64, &family::MX1),
    entry(0x6A02053, "MX230F128H", 128, &family::MX1),
    entry(0x6A03053, "MX230F128L", 128, &family::MX1),
    entry(0x4D00053, "MX250F128B", 128, &family::MX1),
    entry(0x4D02053, "MX250F128C", 128, &family::MX1),
    entry(0x4D04053, "MX250F128D", 128, &family::MX1),
    entry(0x6A12053, "MX250F256H", 256, &family::MX1),
    entry(0x6A13053, "MX250F256L", 256, &family::MX1),
    entry(0x6600053, "MX270F256B", 256, &family::MX1),
    entry(0x660A053, "MX270F256D", 256, &family::MX1),
    entry(0x6A32053, "MX270F512H", 512, &family::MX1),
    entry(0x6A33053, "MX270F512L", 512, &family::MX1),
    entry(0x6A04053, "MX530F128H", 128, &family::MX1),
    entry(0x6A05053, "MX530F128L", 128, &family::MX1),
    entry(0x6A14053, "MX550F256H", 256, &family::MX1),
    entry(0x6A15053, "MX550F256L", 256, &family::MX1),
    entry(0x6A34053, "MX570F512H", 512, &family::MX1),
    entry(0x6A35053, "MX570F512L", 512, &family::MX1),
    entry(0x0902053, "MX320F032H", 32, &family::MX3),
    entry(0x0906053, "MX320F064H", 64, &family::MX3),
    entry(0x090A053, "MX320F128H", 128, &family::MX3),
    entry(0x092A053, "MX320F128L", 128, &family::MX3),
    entry(0x5600053, "MX330F064H", 64, &family::MX3),
    entry(0x5601053, "MX330F064L", 64, &family::MX3),
    entry(0x090D053, "MX340F128H", 128, &family::MX3),
    entry(0x092D053, "MX340F128L", 128, &family::MX3),
    entry(0x0912053, "MX340F256H", 256, &family::MX3),
    entry(0x0916053, "MX340F512H", 512, &family::MX3),
    entry(0x570C053, "MX350F128H", 128, &family::MX3),
    entry(0x570D053, "MX350F128L", 128, &family::MX3),
    entry(0x5704053, "MX350F256H", 256, &family::MX3),
    entry(0x5705053, "MX350F256L", 256, &family::MX3),
    entry(0x0934053, "MX360F256L", 256, &family::MX3),
    entry(0x0938053, "MX360F512L", 512, &family::MX3),
    entry(0x5808053, "MX370F512H", 512, &family::MX3),
    entry(0x5809053, "MX370F512L", 512, &family::MX3),
    entry(0x0942053, "MX420F032H", 32, &family::MX3),
    entry(0x5602053, "MX430F064H", 64, &family::MX3),
    entry(0x5603053, "MX430F064L", 64, &family::MX3),
    entry(0x094D053, "MX440F128H", 128, &family::MX3),
    entry(0x096D053, "MX440F128L", 128, &family::MX3),
    entry(0x0952053, "MX440F256H", 256, &family::MX3),
    entry(0x0956053, "MX440F512H", 512, &family::MX3),
    entry(0x570E053, "MX450F128H", 128, &family::MX3),
    entry(0x570F053, "MX450F128L", 128, &family::MX3),
    entry(0x5706053, "MX450F256H", 256, &family::MX3),
    entry(0x5707053, "MX450F256L", 256, &family::MX3),
    entry(0x0974053, "MX460F256L", 256, &family::MX3),
    entry(0x0978053, "MX460F512L", 512, &family::MX3),
    entry(0x580A053, "MX470F512H", 512, &family::MX3),
    entry(0x580B053, "MX470F512L", 512, &family::MX3),
    entry(0x4400053, "MX534F064H", 64, &family::MX3),
    entry(0x440C053, "MX534F064L", 64, &family::MX3),
    entry(0x4401053, "MX564F064H", 64, &family::MX3),
    entry(0x440D053, "MX564F064L", 64, &family::MX3),
    entry(0x4403053, "MX564F128H", 128, &family::MX3),
    entry(0x440F053, "MX564F128L", 128, &family::MX3),
    entry(0x4317053, "MX575F256H", 256, &family::MX3),
    entry(0x4333053, "MX575F256L", 256, &family::MX3),
    entry(0x4309053, "MX575F512H", 512, &family::MX3),
    entry(0x430F053, "MX575F512L", 512, &family::MX3),
    entry(0x4405053, "MX664F064H", 64, &family::MX3),
    entry(0x4411053, "MX664F064L", 64, &family::MX3),
    entry(0x4407053, "MX664F128H", 128, &family::MX3),
    entry(0x4413053, "MX664F128L", 128, &family::MX3),
    entry(0x430B053, "MX675F256H", 256, &family::MX3),
    entry(0x4305053, "MX675F256L", 256, &family::MX3),
    entry(0x430C053, "MX675F512H", 512, &family::MX3),
    entry(0x4311053, "MX675F512L", 512, &family::MX3),
    entry(0x4325053, "MX695F512H", 512, &family::MX3),
    entry(0x4341053, "MX695F512L", 512, &family::MX3),
    entry(0x440B053, "MX764F128H", 128, &family::MX3),
    entry(0x4417053, "MX764F128L", 128, &family::MX3),
    entry(0x4303053, "MX775F256H", 256, &family::MX3),
    entry(0x4312053, "MX775F256L", 256, &family::MX3),
    entry(0x430D053, "MX775F512H", 512, &family::MX3),
    entry(0x4306053, "MX775F512L", 512, &family::MX3),
    entry(0x430E053, "MX795F512H", 512, &family::MX3),
    entry(0x4307053, "MX795F512L", 512, &family::MX3),
    entry(0x5100053, "MZ0256ECE064", 256, &family::MZ),
    entry(0x510A053, "MZ0256ECE100", 256, &family::MZ),
    entry(0x5114053, "MZ0256ECE124", 256, &family::MZ),
    entry(0x511E053, "MZ0256ECE144", 256, &family::MZ),
    entry(0x5105053, "MZ0256ECF064", 256, &family::MZ),
    entry(0x510F053, "MZ0256ECF100", 256, &family::MZ),
    entry(0x5119053, "MZ0256ECF124", 256, &family::MZ),
    entry(0x5123053, "MZ0256ECF144", 256, &family::MZ),
    entry(0x5101053, "MZ0512ECE064", 512, &family::MZ),
    entry(0x510B053, "MZ0512ECE100", 512, &family::MZ),
    entry(0x5115053, "MZ0512ECE124", 512, &family::MZ),
    entry(0x511F053, "MZ0512ECE144", 512, &family::MZ),
    entry(0x5106053, "MZ0512ECF064", 512, &family::MZ),
    entry(0x5110053, "MZ0512ECF100", 512, &family::MZ),
    entry(0x511A053, "MZ0512ECF124", 512, &family::MZ),
    entry(0x5124053, "MZ0512ECF144", 512, &family::MZ),
    entry(0x5102053, "MZ1024ECE064", 1024, &family::MZ),
    entry(0x510C053, "MZ1024ECE100", 1024, &family::MZ),
    entry(0x5116053, "MZ1024ECE124", 1024, &family::MZ),
    entry(0x5120053, "MZ1024ECE144", 1024, &family::MZ),
    entry(0x5107053, "MZ1024ECF064", 1024, &family::MZ),
    entry(0x5111053, "MZ1024ECF100", 1024, &family::MZ),
    entry(0x511B053, "MZ1024ECF124", 1024, &family::MZ),
    entry(0x5125053, "MZ1024ECF144", 1024, &family::MZ),
    entry(0x5103053, "MZ1024ECG064", 1024, &family::MZ),
    entry(0x510D053, "MZ1024ECG100", 1024, &family::MZ),
    entry(0x5117053, "MZ1024ECG124", 1024, &family::MZ),
    entry(0x5121053, "MZ1024ECG144", 1024, &family::MZ),
    entry(0x5108053, "MZ1024ECH064", 1024, &family::MZ),
    entry(0x5112053, "MZ1024ECH100", 1024, &family::MZ),
    entry(0x511C053, "MZ1024ECH124", 1024, &family::MZ),
    entry(0x5126053, "MZ1024ECH144", 1024, &family::MZ),
    entry(0x5130053, "MZ1024ECM064", 1024, &family::MZ),
    entry(0x513A053, "MZ1024ECM100", 1024, &family::MZ),
    entry(0x5144053, "MZ1024ECM124", 1024, &family::MZ),
    entry(0x514E053, "MZ1024ECM144", 1024, &family::MZ),
    entry(0x5104053, "MZ2048ECG064", 2048, &family::MZ),
    entry(0x510E053, "MZ2048ECG100", 2048, &family::MZ),
    entry(0x5118053, "MZ2048ECG124", 2048, &family::MZ),
    entry(0x5122053, "MZ2048ECG144", 2048, &family::MZ),
    entry(0x5109053, "MZ2048ECH064", 2048, &family::MZ),
    entry(0x5113053, "MZ2048ECH100", 2048, &family::MZ),
    entry(0x511D053, "MZ2048ECH124", 2048, &family::MZ),
    entry(0x5127053, "MZ2048ECH144", 2048, &family::MZ),
    entry(0x5131053, "MZ2048ECM064", 2048, &family::MZ),
    entry(0x513B053, "MZ2048ECM100", 2048, &family::MZ),
    entry(0x5145053, "MZ2048ECM124", 2048, &family::MZ),
    entry(0x514F053, "MZ2048ECM144", 2048, &family::MZ),
    entry(0x7201053, "MZ0512EFE064", 512, &family::MZ),
    entry(0x7206053, "MZ0512EFF064", 512, &family::MZ),
    entry(0x722E053, "MZ0512EFK064", 512, &family::MZ),
    entry(0x7202053, "MZ1024EFE064", 1024, &family::MZ),
    entry(0x7207053, "MZ1024EFF064", 1024, &family::MZ),
    entry(0x722F053, "MZ1024EFK064", 1024, &family::MZ),
    entry(0x7203053, "MZ1024EFG064", 1024, &family::MZ),
    entry(0x7208053, "MZ1024EFH064", 1024, &family::MZ),
    entry(0x7230053, "MZ1024EFM064", 1024, &family::MZ),
    entry(0x7204053, "MZ2048EFG064", 2048, &family::MZ),
    entry(0x7209053, "MZ2048EFH064", 2048, &family::MZ),
    entry(0x7231053, "MZ2048EFM064", 2048, &family::MZ),
    entry(0x720B053, "MZ0512EFE100", 512, &family::MZ),
    entry(0x7210053, "MZ0512EFF100", 512, &family::MZ),
    entry(0x7238053, "MZ0512EFK100", 512, &family::MZ),
    entry(0x720C053, "MZ1024EFE100", 1024, &family::MZ),
    entry(0x7211053, "MZ1024EFF100", 1024, &family::MZ),
    entry(0x7239053, "MZ1024EFK100", 1024, &family::MZ),
    entry(0x720D053, "MZ1024EFG100", 1024, &family::MZ),
    entry(0x7212053, "MZ1024EFH100", 1024, &family::MZ),
    entry(0x723A053, "MZ1024EFM100", 1024, &family::MZ),
    entry(0x720E053, "MZ2048EFG100", 2048, &family::MZ),
    entry(0x7213053, "MZ2048EFH100", 2048, &family::MZ),
    entry(0x723B053, "MZ2048EFM100", 2048, &family::MZ),
    entry(0x7215053, "MZ0512EFE124", 512, &family::MZ),
    entry(0x721A053, "MZ0512EFF124", 512, &family::MZ),
    entry(0x7242053, "MZ0512EFK124", 512, &family::MZ),
    entry(0x7216053, "MZ1024EFE124", 1024, &family::MZ),
    entry(0x721B053, "MZ1024EFF124", 1024, &family::MZ),
    entry(0x7243053, "MZ1024EFK124", 1024, &family::MZ),
    entry(0x7217053, "MZ1024EFG124", 1024, &family::MZ),
    entry(0x721C053, "MZ1024EFH124", 1024, &family::MZ),
    entry(0x7244053, "MZ1024EFM124", 1024, &family::MZ),
    entry(0x7218053, "MZ2048EFG124", 2048, &family::MZ),
    entry(0x721D053, "MZ2048EFH124", 2048, &family::MZ),
    entry(0x7245053, "MZ2048EFM124", 2048, &family::MZ),
    entry(0x721F053, "MZ0512EFE144", 512, &family::MZ),
    entry(0x7224053, "MZ0512EFF144", 512, &family::MZ),
    entry(0x724C053, "MZ0512EFK144", 512, &family::MZ),
    entry(0x7220053, "MZ1024EFE144", 1024, &family::MZ),
    entry(0x7225053, "MZ1024EFF144", 1024, &family::MZ),
    entry(0x724D053, "MZ1024EFK144", 1024, &family::MZ),
    entry(0x7221053, "MZ1024EFG144", 1024, &family::MZ),
    entry(0x7226053, "MZ1024EFH144", 1024, &family::MZ),
    entry(0x724E053, "MZ1024EFM144", 1024, &family::MZ),
    entry(0x7222053, "MZ2048EFG144", 2048, &family::MZ),
    entry(0x7227053, "MZ2048EFH144", 2048, &family::MZ),
    entry(0x724F053, "MZ2048EFM144", 2048, &family::MZ),
    entry(0x5f4f053, "MZ2048XXXXXX", 2048, &family::MZ),
    entry(0x5fb7053, "MZ2048XXXXXX", 2048, &family::MZ),
    entry(0x6b12053, "MM0064GPL028", 64, &family::MM_GPL),
    entry(0x6b16053, "MM0064GPL036", 64, &family::MM_GPL),
    entry(0x6b04053, "MM0016GPL028", 16, &family::MM_GPL),
    entry(0x771e053, "MM0256GPM064", 256, &family::MM_GPM),
    entry(0x6201053, "MK1024MCF100", 1024, &family::MK),
    entry(0xEAFB00B, "Bootloader", 0, &family::BOOTLOADER),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyKind;

    #[test]
    fn probe_resolves_mx795f512l() {
        let table = DeviceTable::new();
        let variant = table.lookup(0x4307053).expect("known device");
        assert_eq!(variant.name, "MX795F512L");
        assert_eq!(variant.flash_kbytes, 512);
        assert_eq!(variant.family.kind, FamilyKind::Mx3);
    }

    #[test]
    fn revision_bits_are_ignored() {
        let table = DeviceTable::new();
        // Same silicon, revision field 0xf.
        let variant = table.lookup(0xf430_7053).expect("revision masked");
        assert_eq!(variant.name, "MX795F512L");
        assert!(table.lookup(0x0000_0053).is_none());
    }

    #[test]
    fn extension_file_overrides_and_appends(){
        use std::io::Write;
        let mut table = DeviceTable::new();
        let before = table.len();
        let mut file = tempfile_path("pic32flash-devtab-test.ron");
        writeln!(
            file.1,
            r#"[
    (name: "MX795F512L-XL", id: 0x4307053, family: "MX3", flash_kbytes: 512),
    (name: "MZ9999FOO100", id: 0x7999053, family: "MZ", flash_kbytes: 2048),
]"#
        )
        .unwrap();
        drop(file.1);
        let added = table.extend_from_file(&file.0).unwrap();
        std::fs::remove_file(&file.0).ok();
        assert_eq!(added, 2);
        assert_eq!(table.len(), before + 1);
        assert_eq!(table.lookup(0x4307053).unwrap().name, "MX795F512L-XL");
        assert_eq!(
            table.lookup(0x7999053).unwrap().family.kind,
            FamilyKind::Mz
        );
    }

    #[test]
    fn unknown_family_name_is_a_config_error() {
        use std::io::Write;
        let mut table = DeviceTable::new();
        let mut file = tempfile_path("pic32flash-devtab-badfam.ron");
        writeln!(
            file.1,
            r#"[(name: "X", id: 0x1, family: "MQ", flash_kbytes: 1)]"#
        )
        .unwrap();
        drop(file.1);
        let result = table.extend_from_file(&file.0);
        std::fs::remove_file(&file.0).ok();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    fn tempfile_path(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(name);
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
