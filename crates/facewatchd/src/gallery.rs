//! Reference photos and the student roster.
//!
//! The gallery directory holds reference images plus an optional
//! `students.toml`:
//!
//! ```toml
//! [[student]]
//! roll_number = "21CS042"
//! name = "Asha Verma"
//! department = "Computer Science"
//! semester = 5
//! photo = "asha.jpg"
//! ```

use facewatch_hw::is_image_url;
use image::RgbImage;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ROSTER_FILE: &str = "students.toml";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no reference photo for roll number {roll}; available: {}", available.join(", "))]
    UnknownRoll { roll: String, available: Vec<String> },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid roster {path}: {source}")]
    Roster {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to fetch reference photo: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to decode reference photo {location}: {source}")]
    Decode {
        location: String,
        source: image::ImageError,
    },
}

/// A student as listed in the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub roll_number: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// File name inside the gallery, absolute path, or http(s) URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RosterFile {
    #[serde(default, rename = "student")]
    students: Vec<Student>,
}

/// Where a reference photo is loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoLocation {
    File(PathBuf),
    Url(Url),
}

impl std::fmt::Display for PhotoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhotoLocation::File(path) => write!(f, "{}", path.display()),
            PhotoLocation::Url(url) => write!(f, "{url}"),
        }
    }
}

/// A resolved target: who it is and where the reference photo lives.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub roll_number: String,
    pub name: String,
    pub photo: PhotoLocation,
}

pub struct Gallery {
    dir: PathBuf,
    roster: Vec<Student>,
    http: reqwest::Client,
}

impl Gallery {
    /// Open the gallery at `dir`. A missing directory is an empty gallery.
    pub fn open(dir: &Path) -> Result<Self, GalleryError> {
        let roster_path = dir.join(ROSTER_FILE);
        let roster = match std::fs::read_to_string(&roster_path) {
            Ok(text) => {
                toml::from_str::<RosterFile>(&text)
                    .map_err(|source| GalleryError::Roster {
                        path: roster_path.clone(),
                        source,
                    })?
                    .students
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(GalleryError::Io {
                    path: roster_path,
                    source,
                })
            }
        };

        let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        tracing::info!(dir = %dir.display(), students = roster.len(), "gallery opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            roster,
            http,
        })
    }

    /// Roster students, followed by loose reference images that no roster
    /// entry claims (listed under their file stem).
    pub fn students(&self) -> Result<Vec<Student>, GalleryError> {
        let mut students = self.roster.clone();
        for path in self.reference_images()? {
            let file_name = file_name(&path);
            let claimed = self
                .roster
                .iter()
                .any(|s| s.photo.as_deref() == Some(file_name.as_str()));
            if claimed {
                continue;
            }
            let stem = file_stem(&path);
            students.push(Student {
                roll_number: stem.clone(),
                name: stem,
                department: None,
                semester: None,
                email: None,
                phone: None,
                photo: Some(file_name),
                video_url: None,
            });
        }
        Ok(students)
    }

    /// Image files directly inside the gallery, sorted by file name.
    pub fn reference_images(&self) -> Result<Vec<PathBuf>, GalleryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(GalleryError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut images: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_url(&file_name(path)))
            .collect();
        images.sort_by_key(|path| file_name(path));
        Ok(images)
    }

    /// Find the reference photo for a roll number.
    ///
    /// A roster entry with a photo wins; otherwise the first image whose
    /// file stem contains the roll number, ignoring case.
    pub fn resolve(&self, roll_number: &str) -> Result<Reference, GalleryError> {
        let roll = roll_number.trim();
        let entry = self
            .roster
            .iter()
            .find(|s| s.roll_number.eq_ignore_ascii_case(roll));

        if let Some(student) = entry {
            if let Some(photo) = student.photo.as_deref() {
                return Ok(Reference {
                    roll_number: student.roll_number.clone(),
                    name: student.name.clone(),
                    photo: self.locate(photo),
                });
            }
        }

        let images = self.reference_images()?;
        let needle = roll.to_lowercase();
        let found = images
            .iter()
            .find(|path| file_stem(path).to_lowercase().contains(&needle));

        match found {
            Some(path) => Ok(Reference {
                roll_number: roll.to_string(),
                name: entry.map(|s| s.name.clone()).unwrap_or_else(|| file_stem(path)),
                photo: PhotoLocation::File(path.clone()),
            }),
            None => Err(GalleryError::UnknownRoll {
                roll: roll.to_string(),
                available: images.iter().map(|p| file_name(p)).collect(),
            }),
        }
    }

    fn locate(&self, photo: &str) -> PhotoLocation {
        if let Ok(url) = Url::parse(photo) {
            if matches!(url.scheme(), "http" | "https") {
                return PhotoLocation::Url(url);
            }
        }
        let path = Path::new(photo);
        if path.is_absolute() {
            PhotoLocation::File(path.to_path_buf())
        } else {
            PhotoLocation::File(self.dir.join(path))
        }
    }

    /// Load and decode a reference photo.
    pub async fn load_photo(&self, reference: &Reference) -> Result<RgbImage, GalleryError> {
        let bytes = match &reference.photo {
            PhotoLocation::File(path) => tokio::fs::read(path).await.map_err(|source| GalleryError::Io {
                path: path.clone(),
                source,
            })?,
            PhotoLocation::Url(url) => self
                .http
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?
                .to_vec(),
        };

        image::load_from_memory(&bytes)
            .map(|img| img.to_rgb8())
            .map_err(|source| GalleryError::Decode {
                location: reference.photo.to_string(),
                source,
            })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
