use crate::config::BinaryKind;
use crate::manifest::Manifest;

/// Where each package's contents land inside the assembled archive. An empty
/// prefix merges the package at the archive root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageRootMap {
    label: &'static str,
    umbrella: &'static str,
    entries: &'static [(&'static str, &'static str)],
}

const PLAYER_ROOTS: &[(&str, &str)] = &[
    ("RobloxApp.zip", ""),
    ("redist.zip", ""),
    ("shaders.zip", "shaders/"),
    ("ssl.zip", "ssl/"),
    ("WebView2.zip", ""),
    ("WebView2RuntimeInstaller.zip", "WebView2RuntimeInstaller/"),
    ("content-avatar.zip", "content/avatar/"),
    ("content-configs.zip", "content/configs/"),
    ("content-fonts.zip", "content/fonts/"),
    ("content-sky.zip", "content/sky/"),
    ("content-sounds.zip", "content/sounds/"),
    ("content-textures2.zip", "content/textures/"),
    ("content-models.zip", "content/models/"),
    ("content-platform-fonts.zip", "PlatformContent/pc/fonts/"),
    (
        "content-platform-dictionaries.zip",
        "PlatformContent/pc/shared_compression_dictionaries/",
    ),
    ("content-terrain.zip", "PlatformContent/pc/terrain/"),
    ("content-textures3.zip", "PlatformContent/pc/textures/"),
    ("extracontent-luapackages.zip", "ExtraContent/LuaPackages/"),
    ("extracontent-translations.zip", "ExtraContent/translations/"),
    ("extracontent-models.zip", "ExtraContent/models/"),
    ("extracontent-textures.zip", "ExtraContent/textures/"),
    ("extracontent-places.zip", "ExtraContent/places/"),
];

const STUDIO_ROOTS: &[(&str, &str)] = &[
    ("RobloxStudio.zip", ""),
    ("RibbonConfig.zip", "RibbonConfig/"),
    ("redist.zip", ""),
    ("Libraries.zip", ""),
    ("LibrariesQt5.zip", ""),
    ("WebView2.zip", ""),
    ("WebView2RuntimeInstaller.zip", ""),
    ("shaders.zip", "shaders/"),
    ("ssl.zip", "ssl/"),
    ("Qml.zip", "Qml/"),
    ("Plugins.zip", "Plugins/"),
    ("StudioFonts.zip", "StudioFonts/"),
    ("BuiltInPlugins.zip", "BuiltInPlugins/"),
    ("ApplicationConfig.zip", "ApplicationConfig/"),
    ("BuiltInStandalonePlugins.zip", "BuiltInStandalonePlugins/"),
    ("content-qt_translations.zip", "content/qt_translations/"),
    ("content-sky.zip", "content/sky/"),
    ("content-fonts.zip", "content/fonts/"),
    ("content-avatar.zip", "content/avatar/"),
    ("content-models.zip", "content/models/"),
    ("content-sounds.zip", "content/sounds/"),
    ("content-configs.zip", "content/configs/"),
    ("content-api-docs.zip", "content/api_docs/"),
    ("content-textures2.zip", "content/textures/"),
    ("content-studio_svg_textures.zip", "content/studio_svg_textures/"),
    ("content-platform-fonts.zip", "PlatformContent/pc/fonts/"),
    (
        "content-platform-dictionaries.zip",
        "PlatformContent/pc/shared_compression_dictionaries/",
    ),
    ("content-terrain.zip", "PlatformContent/pc/terrain/"),
    ("content-textures3.zip", "PlatformContent/pc/textures/"),
    ("extracontent-translations.zip", "ExtraContent/translations/"),
    ("extracontent-luapackages.zip", "ExtraContent/LuaPackages/"),
    ("extracontent-textures.zip", "ExtraContent/textures/"),
    ("extracontent-scripts.zip", "ExtraContent/scripts/"),
    ("extracontent-models.zip", "ExtraContent/models/"),
];

pub const PLAYER: PackageRootMap = PackageRootMap {
    label: "player",
    umbrella: "RobloxApp.zip",
    entries: PLAYER_ROOTS,
};

pub const STUDIO: PackageRootMap = PackageRootMap {
    label: "studio",
    umbrella: "RobloxStudio.zip",
    entries: STUDIO_ROOTS,
};

impl PackageRootMap {
    #[cfg(test)]
    pub const fn custom(
        label: &'static str,
        umbrella: &'static str,
        entries: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self {
            label,
            umbrella,
            entries,
        }
    }

    pub fn for_binary(kind: BinaryKind) -> Self {
        match kind {
            BinaryKind::Player => PLAYER,
            BinaryKind::Studio => STUDIO,
        }
    }

    /// Picks the variant whose umbrella package appears in the manifest.
    pub fn for_manifest(manifest: &Manifest) -> Option<Self> {
        [PLAYER, STUDIO]
            .into_iter()
            .find(|map| manifest.packages.iter().any(|name| map.is_umbrella(name)))
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn umbrella(&self) -> &'static str {
        self.umbrella
    }

    pub fn is_umbrella(&self, package: &str) -> bool {
        self.umbrella.eq_ignore_ascii_case(package)
    }

    pub fn prefix_for(&self, package: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(package))
            .map(|(_, prefix)| *prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest;

    #[test]
    fn selects_player_map_from_umbrella() {
        let manifest = manifest::parse("v0\nshaders.zip\nRobloxApp.zip\n");
        let map = PackageRootMap::for_manifest(&manifest).expect("player map");
        assert_eq!(map.label(), "player");
        assert_eq!(map.prefix_for("RobloxApp.zip"), Some(""));
        assert_eq!(map.prefix_for("shaders.zip"), Some("shaders/"));
    }

    #[test]
    fn selects_studio_map_from_umbrella() {
        let manifest = manifest::parse("v0\nRobloxStudio.zip\nQml.zip\n");
        let map = PackageRootMap::for_manifest(&manifest).expect("studio map");
        assert_eq!(map, STUDIO);
        assert_eq!(map.prefix_for("Qml.zip"), Some("Qml/"));
        assert_eq!(map.prefix_for("WebView2RuntimeInstaller.zip"), Some(""));
    }

    #[test]
    fn no_umbrella_means_no_map() {
        let manifest = manifest::parse("v0\nshaders.zip\n");
        assert!(PackageRootMap::for_manifest(&manifest).is_none());
    }

    #[test]
    fn unknown_package_has_no_prefix() {
        assert_eq!(PLAYER.prefix_for("RobloxPlayerLauncher.exe"), None);
        assert_eq!(PLAYER.prefix_for("mystery.zip"), None);
    }

    #[test]
    fn every_prefix_is_root_or_slash_terminated() {
        for map in [PLAYER, STUDIO] {
            for (name, prefix) in map.entries {
                assert!(
                    prefix.is_empty() || prefix.ends_with('/'),
                    "{name} -> {prefix}"
                );
                assert!(!prefix.starts_with('/'));
            }
            assert!(map.prefix_for(map.umbrella()).is_some());
        }
    }
}
