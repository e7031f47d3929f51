use std::path::Path;
use std::process::ExitCode;

use crate::caption_store::CaptionStore;
use crate::error::CaptionError;
use crate::library;
use crate::session::SessionHandle;

pub fn list(folder: &Path, session: &SessionHandle) -> Result<ExitCode, CaptionError> {
    let images = library::list_images(folder)?;
    session.open_folder(folder, library::file_map(&images))?;

    let store = CaptionStore::new();
    let mut captioned = 0usize;
    for image in &images {
        let has_caption = store.has_caption(image);
        if has_caption {
            captioned += 1;
        }
        println!("{} {}", if has_caption { "*" } else { " " }, image.file_name());
    }
    println!("{} of {} images captioned", captioned, images.len());
    Ok(ExitCode::SUCCESS)
}

pub fn search(
    folder: &Path,
    text: &str,
    case_sensitive: bool,
    session: &SessionHandle,
) -> Result<ExitCode, CaptionError> {
    let images = library::list_images(folder)?;
    session.open_folder(folder, library::file_map(&images))?;

    let matches = library::search_captions(&images, text, case_sensitive)?;
    for found in &matches {
        println!(
            "{}:{}: {} ({})",
            found.image.file_name(),
            found.line_number,
            found.line,
            found.occurrences
        );
    }
    let total: usize = matches.iter().map(|found| found.occurrences).sum();
    println!("{} occurrence(s) on {} line(s)", total, matches.len());
    Ok(ExitCode::SUCCESS)
}

pub fn replace(
    folder: &Path,
    text: &str,
    replacement: &str,
    case_sensitive: bool,
    session: &SessionHandle,
) -> Result<ExitCode, CaptionError> {
    let images = library::list_images(folder)?;
    session.open_folder(folder, library::file_map(&images))?;

    let summary = library::replace_in_captions(&images, text, replacement, case_sensitive)?;
    for error in &summary.errors {
        eprintln!("{}", error);
    }
    println!(
        "Replaced {} occurrence(s) in {} caption(s)",
        summary.replacements, summary.files_changed
    );
    Ok(if summary.errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub fn rename(folder: &Path, session: &SessionHandle) -> Result<ExitCode, CaptionError> {
    let current_image = session.snapshot().current_image;
    let renamed = library::rename_to_numbers(folder)?;

    for (old, new) in &renamed {
        if old != new {
            println!("{} -> {}", old.display(), new.display());
        }
    }

    let images = library::list_images(folder)?;
    session.open_folder(folder, library::file_map(&images))?;
    let moved_current = current_image.and_then(|name| {
        renamed
            .iter()
            .find(|(old, _)| old.file_name().is_some_and(|old_name| old_name.to_string_lossy() == name))
            .and_then(|(_, new)| new.file_name())
            .map(|new_name| new_name.to_string_lossy().to_string())
    });
    if let Some(name) = moved_current {
        session.open_image(&name)?;
    }

    println!("Renamed {} image(s)", renamed.len());
    Ok(ExitCode::SUCCESS)
}
