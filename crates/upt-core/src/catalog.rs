use tracing::debug;

use crate::model::{ArtifactListing, BuildArtifact, Platform};

/// In-memory copy of the artifact server's build list, per platform.
#[derive(Clone, Debug, Default)]
pub struct ArtifactCatalog {
    android: Vec<BuildArtifact>,
    ios: Vec<BuildArtifact>,
    loaded: bool,
}

impl ArtifactCatalog {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Replaces the whole catalog with a fresh listing.
    ///
    /// A flat (legacy) listing is split by file extension.
    pub fn replace(&mut self, listing: ArtifactListing) {
        let (mut android, mut ios) = match listing {
            ArtifactListing::ByPlatform { android, ios } => (android, ios),
            ArtifactListing::Flat(items) => items
                .into_iter()
                .partition(|a| Platform::from_filename(&a.filename) == Platform::Android),
        };
        sort_newest_first(&mut android);
        sort_newest_first(&mut ios);
        debug!(
            "artifact catalog: {} android, {} ios",
            android.len(),
            ios.len()
        );
        self.android = android;
        self.ios = ios;
        self.loaded = true;
    }

    pub fn for_platform(&self, platform: Platform) -> &[BuildArtifact] {
        match platform {
            Platform::Android => &self.android,
            Platform::Ios => &self.ios,
        }
    }

    pub fn find(&self, platform: Platform, filename: &str) -> Option<&BuildArtifact> {
        self.for_platform(platform)
            .iter()
            .find(|a| a.filename == filename)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.android
            .iter()
            .chain(self.ios.iter())
            .any(|a| a.filename == filename)
    }

    /// Makes sure `filename` is listed, adding a bare entry when the server has not caught up yet.
    pub fn ensure_listed(&mut self, filename: &str) -> bool {
        if self.contains(filename) {
            return false;
        }
        let entry = BuildArtifact {
            filename: filename.to_string(),
            ..BuildArtifact::default()
        };
        match Platform::from_filename(filename) {
            Platform::Android => self.android.insert(0, entry),
            Platform::Ios => self.ios.insert(0, entry),
        }
        true
    }

    pub fn len(&self) -> usize {
        self.android.len() + self.ios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Upload times are "YYYY-MM-DD HH:MM:SS", so lexical order is chronological.
fn sort_newest_first(items: &mut [BuildArtifact]) {
    items.sort_by(|a, b| {
        b.upload_time
            .cmp(&a.upload_time)
            .then_with(|| a.filename.cmp(&b.filename))
    });
}
