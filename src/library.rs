use rayon::prelude::*;
use regex::{NoExpand, Regex, RegexBuilder};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::caption_store::{caption_path_for, CaptionStore, ImageRef};
use crate::error::CaptionError;

const IMAGE_EXTENSIONS: &[&str] = &["bmp", "jpg", "jpeg", "png", "webp", "jxl"];
const TEMP_PREFIX: &str = "temp_";

/// Images directly inside `folder`, in natural file-name order.
pub fn list_images(folder: &Path) -> Result<Vec<ImageRef>, CaptionError> {
    if !folder.is_dir() {
        return Err(CaptionError::io(
            folder,
            std::io::Error::new(ErrorKind::NotFound, "not a directory"),
        ));
    }

    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_supported_image(path))
        .collect();

    paths.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    log::info!("Found {} images in {}", paths.len(), folder.display());
    Ok(paths.into_iter().map(ImageRef::new).collect())
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn file_map(images: &[ImageRef]) -> BTreeMap<String, PathBuf> {
    images
        .iter()
        .map(|image| (image.file_name(), image.path.clone()))
        .collect()
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalPart {
    Text(String),
    Number { digits: usize, value: String },
}

/// Splits into alternating text and digit runs, always starting with text,
/// so parts at the same position are of the same kind.
fn natural_key(name: &str) -> Vec<NaturalPart> {
    let mut parts = Vec::new();
    let mut run = String::new();
    let mut in_digits = false;

    for ch in name.chars() {
        if ch.is_ascii_digit() != in_digits {
            parts.push(close_run(&run, in_digits));
            run.clear();
            in_digits = !in_digits;
        }
        run.push(ch);
    }
    parts.push(close_run(&run, in_digits));
    parts
}

fn close_run(run: &str, digits: bool) -> NaturalPart {
    if digits {
        let value = run.trim_start_matches('0');
        NaturalPart::Number {
            digits: value.len(),
            value: value.to_string(),
        }
    } else {
        NaturalPart::Text(run.to_lowercase())
    }
}

/// Digit runs compare by value, text runs case-insensitively.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b)).then_with(|| a.cmp(b))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionMatch {
    pub image: ImageRef,
    /// 1-based.
    pub line_number: usize,
    pub line: String,
    pub occurrences: usize,
}

fn literal_pattern(needle: &str, case_sensitive: bool) -> Result<Regex, CaptionError> {
    Ok(RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(!case_sensitive)
        .build()?)
}

/// Raw sidecar content, `None` when the image has no sidecar.
fn read_sidecar(image: &ImageRef) -> Result<Option<String>, CaptionError> {
    match fs::read_to_string(&image.caption_path) {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(CaptionError::io(&image.caption_path, error)),
    }
}

/// Every caption line containing `needle`, grouped by image in input order.
pub fn search_captions(
    images: &[ImageRef],
    needle: &str,
    case_sensitive: bool,
) -> Result<Vec<CaptionMatch>, CaptionError> {
    if needle.is_empty() {
        return Ok(Vec::new());
    }
    let pattern = literal_pattern(needle, case_sensitive)?;

    let matches = images
        .par_iter()
        .flat_map_iter(|image| {
            let content = match read_sidecar(image) {
                Ok(content) => content.unwrap_or_default(),
                Err(error) => {
                    log::warn!("Skipping caption during search: {}", error);
                    String::new()
                }
            };
            content
                .lines()
                .enumerate()
                .filter_map(|(index, line)| {
                    let occurrences = pattern.find_iter(line).count();
                    (occurrences > 0).then(|| CaptionMatch {
                        image: image.clone(),
                        line_number: index + 1,
                        line: line.trim_end().to_string(),
                        occurrences,
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(matches)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplaceSummary {
    pub files_changed: usize,
    pub replacements: usize,
    /// One message per caption file that could not be updated.
    pub errors: Vec<String>,
}

/// Replaces every occurrence of `needle` in the captions of `images`.
///
/// Only captions that change are rewritten. A file that fails is reported in
/// the summary and the others are still processed.
pub fn replace_in_captions(
    images: &[ImageRef],
    needle: &str,
    replacement: &str,
    case_sensitive: bool,
) -> Result<ReplaceSummary, CaptionError> {
    if needle.is_empty() {
        return Ok(ReplaceSummary::default());
    }
    let pattern = literal_pattern(needle, case_sensitive)?;
    let store = CaptionStore::new();

    let outcomes: Vec<Result<usize, CaptionError>> = images
        .par_iter()
        .map(|image| {
            let Some(content) = read_sidecar(image)? else {
                return Ok(0);
            };
            let count = pattern.find_iter(&content).count();
            if count == 0 {
                return Ok(0);
            }
            let updated = pattern.replace_all(&content, NoExpand(replacement));
            if updated == content {
                return Ok(0);
            }
            store.save(image, &updated)?;
            Ok(count)
        })
        .collect();

    let mut summary = ReplaceSummary::default();
    for outcome in outcomes {
        match outcome {
            Ok(0) => {}
            Ok(count) => {
                summary.files_changed += 1;
                summary.replacements += count;
            }
            Err(error) => summary.errors.push(error.to_string()),
        }
    }
    log::info!(
        "Replaced {} occurrences in {} captions ({} failures)",
        summary.replacements,
        summary.files_changed,
        summary.errors.len()
    );
    Ok(summary)
}

/// Renames every image in `folder` to its 1-based position in natural
/// order, zero-padded to the digit count of the total, and moves caption
/// sidecars along. Returns `(old, new)` image paths.
///
/// Everything is first moved to staging names so a new name never collides
/// with an image that has not been renamed yet. Nothing is moved when a
/// final name is taken by a file outside the rename.
pub fn rename_to_numbers(folder: &Path) -> Result<Vec<(PathBuf, PathBuf)>, CaptionError> {
    let images = list_images(folder)?;
    let padding = images.len().to_string().len();

    let plan: Vec<RenamePlan> = images
        .iter()
        .enumerate()
        .map(|(index, image)| RenamePlan {
            image: image.path.clone(),
            caption: image.caption_path.is_file().then(|| image.caption_path.clone()),
            number: format!("{:0width$}", index + 1, width = padding),
            suffix: image
                .path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default(),
        })
        .collect();

    let sources: HashSet<&Path> = plan
        .iter()
        .flat_map(|entry| std::iter::once(entry.image.as_path()).chain(entry.caption.as_deref()))
        .collect();
    for entry in &plan {
        let target = entry.target(folder, "");
        let mut taken = vec![target.clone()];
        if entry.caption.is_some() {
            taken.push(caption_path_for(&target));
        }
        if let Some(blocked) = taken
            .into_iter()
            .find(|path| path.exists() && !sources.contains(path.as_path()))
        {
            return Err(CaptionError::io(
                &blocked,
                std::io::Error::new(ErrorKind::AlreadyExists, "rename target already exists"),
            ));
        }
    }

    let prefix = staging_prefix(folder, &plan);
    let mut staged = Vec::with_capacity(plan.len());
    for entry in &plan {
        let temp_image = entry.target(folder, &prefix);
        move_file(&entry.image, &temp_image)?;
        if let Some(caption) = &entry.caption {
            move_file(caption, &caption_path_for(&temp_image))?;
        }
        staged.push(temp_image);
    }

    let mut renamed = Vec::with_capacity(plan.len());
    for (entry, temp_image) in plan.iter().zip(staged) {
        let final_image = entry.target(folder, "");
        move_file(&temp_image, &final_image)?;
        if entry.caption.is_some() {
            move_file(&caption_path_for(&temp_image), &caption_path_for(&final_image))?;
        }
        renamed.push((entry.image.clone(), final_image));
    }

    log::info!("Renamed {} images in {}", renamed.len(), folder.display());
    Ok(renamed)
}

struct RenamePlan {
    image: PathBuf,
    caption: Option<PathBuf>,
    number: String,
    suffix: String,
}

impl RenamePlan {
    fn target(&self, folder: &Path, prefix: &str) -> PathBuf {
        folder.join(format!("{}{}{}", prefix, self.number, self.suffix))
    }
}

/// First of `temp_`, `temp1_`, `temp2_`, ... whose staging names are all free.
fn staging_prefix(folder: &Path, plan: &[RenamePlan]) -> String {
    let mut attempt = 0usize;
    loop {
        let prefix = if attempt == 0 {
            TEMP_PREFIX.to_string()
        } else {
            format!("temp{}_", attempt)
        };
        let free = plan.iter().all(|entry| {
            let staged = entry.target(folder, &prefix);
            !staged.exists() && !caption_path_for(&staged).exists()
        });
        if free {
            return prefix;
        }
        attempt += 1;
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), CaptionError> {
    fs::rename(from, to).map_err(|e| CaptionError::io(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("captioner_library_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
    }

    fn names(images: &[ImageRef]) -> Vec<String> {
        images.iter().map(ImageRef::file_name).collect()
    }

    #[test]
    fn natural_order_compares_numbers_by_value() {
        let mut files = vec!["img10.png", "IMG2.png", "img1.png", "img02b.png", "b.png", "A.png"];
        files.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(
            files,
            vec!["A.png", "b.png", "img1.png", "IMG2.png", "img02b.png", "img10.png"]
        );
    }

    #[test]
    fn lists_only_supported_images_in_folder() {
        let dir = test_dir("list");
        touch(&dir, &["10.jpg", "2.PNG", "notes.txt", "3.webp", "4.jxl", "5.gif"]);
        fs::create_dir_all(dir.join("nested")).unwrap();
        touch(&dir.join("nested"), &["1.jpg"]);

        let images = list_images(&dir).unwrap();
        assert_eq!(names(&images), vec!["2.PNG", "3.webp", "4.jxl", "10.jpg"]);

        let map = file_map(&images);
        assert_eq!(map.get("10.jpg"), Some(&dir.join("10.jpg")));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn listing_missing_folder_fails() {
        let dir = test_dir("list_missing");
        assert!(list_images(&dir.join("absent")).is_err());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn search_reports_lines_and_counts() {
        let dir = test_dir("search");
        touch(&dir, &["a.jpg", "b.jpg", "c.jpg"]);
        fs::write(dir.join("a.txt"), "A Cat sits.\nThe cat and the cat.\n").unwrap();
        fs::write(dir.join("b.txt"), "A dog.").unwrap();
        let images = list_images(&dir).unwrap();

        let found = search_captions(&images, "cat", false).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].line_number, 1);
        assert_eq!(found[1].line, "The cat and the cat.");
        assert_eq!(found[1].occurrences, 2);

        let sensitive = search_captions(&images, "Cat", true).unwrap();
        assert_eq!(sensitive.len(), 1);
        assert!(search_captions(&images, "", false).unwrap().is_empty());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn replace_rewrites_only_changed_captions() {
        let dir = test_dir("replace");
        touch(&dir, &["a.jpg", "b.jpg"]);
        fs::write(dir.join("a.txt"), "A CAT. a cat.").unwrap();
        fs::write(dir.join("b.txt"), "A dog.").unwrap();
        let images = list_images(&dir).unwrap();
        let untouched_before = fs::metadata(dir.join("b.txt")).unwrap().modified().unwrap();

        let summary = replace_in_captions(&images, "cat", "$1 fox", false).unwrap();

        assert_eq!(summary.files_changed, 1);
        assert_eq!(summary.replacements, 2);
        assert!(summary.errors.is_empty());
        assert_eq!(fs::read_to_string(dir.join("a.txt")).unwrap(), "A $1 fox. a $1 fox.");
        assert_eq!(
            fs::metadata(dir.join("b.txt")).unwrap().modified().unwrap(),
            untouched_before
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn replace_collects_per_file_failures() {
        let dir = test_dir("replace_fail");
        touch(&dir, &["a.jpg", "b.jpg"]);
        fs::create_dir_all(dir.join("a.txt")).unwrap();
        fs::write(dir.join("b.txt"), "old text").unwrap();
        let images = list_images(&dir).unwrap();

        let summary = replace_in_captions(&images, "old", "new", true).unwrap();

        assert_eq!(summary.files_changed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(fs::read_to_string(dir.join("b.txt")).unwrap(), "new text");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rename_numbers_images_and_moves_sidecars() {
        let dir = test_dir("rename");
        let originals: Vec<String> = (1..=10).map(|n| format!("shot{}.jpg", n)).collect();
        for name in &originals {
            touch(&dir, &[name.as_str()]);
        }
        // Already named like a target of another image.
        touch(&dir, &["01.png"]);
        fs::write(dir.join("shot2.txt"), "second").unwrap();

        let renamed = rename_to_numbers(&dir).unwrap();

        assert_eq!(renamed.len(), 11);
        assert_eq!(renamed[0], (dir.join("01.png"), dir.join("01.png")));
        assert_eq!(renamed[2], (dir.join("shot2.jpg"), dir.join("03.jpg")));
        assert_eq!(fs::read_to_string(dir.join("03.jpg")).unwrap(), "shot2.jpg");
        assert_eq!(fs::read_to_string(dir.join("03.txt")).unwrap(), "second");
        assert_eq!(
            names(&list_images(&dir).unwrap()),
            (1..=11)
                .map(|n| format!("{:02}.{}", n, if n == 1 { "png" } else { "jpg" }))
                .collect::<Vec<_>>()
        );
        assert!(!dir.join("shot2.txt").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rename_stages_around_existing_temp_names() {
        let dir = test_dir("rename_temp_names");
        touch(&dir, &["a.jpg", "b.jpg", "temp_2.jpg", "temp_1.txt"]);
        fs::write(dir.join("b.txt"), "bee").unwrap();

        let renamed = rename_to_numbers(&dir).unwrap();

        assert_eq!(renamed.len(), 3);
        assert_eq!(fs::read_to_string(dir.join("1.jpg")).unwrap(), "a.jpg");
        assert_eq!(fs::read_to_string(dir.join("2.jpg")).unwrap(), "b.jpg");
        assert_eq!(fs::read_to_string(dir.join("2.txt")).unwrap(), "bee");
        assert_eq!(fs::read_to_string(dir.join("3.jpg")).unwrap(), "temp_2.jpg");
        // Unrelated to any image, left alone.
        assert_eq!(fs::read_to_string(dir.join("temp_1.txt")).unwrap(), "temp_1.txt");
        assert_eq!(names(&list_images(&dir).unwrap()), ["1.jpg", "2.jpg", "3.jpg"]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rename_refuses_to_overwrite_foreign_sidecar() {
        let dir = test_dir("rename_foreign_sidecar");
        touch(&dir, &["a.jpg"]);
        fs::write(dir.join("a.txt"), "caption").unwrap();
        fs::write(dir.join("1.txt"), "orphan").unwrap();

        let error = rename_to_numbers(&dir).unwrap_err();

        assert!(matches!(error, CaptionError::Io { ref path, .. } if path == &dir.join("1.txt")));
        assert!(dir.join("a.jpg").exists());
        assert_eq!(fs::read_to_string(dir.join("a.txt")).unwrap(), "caption");
        assert_eq!(fs::read_to_string(dir.join("1.txt")).unwrap(), "orphan");

        fs::remove_dir_all(&dir).ok();
    }
}
