//! Folds one batch of debounced notify events into a single [`FileEvent`]
//! per tracked file, re-checked against the file system.
//!
//! Timing is handled by `notify-debouncer-full`: a batch only arrives once
//! its paths have been quiet for the debounce window. What is left here is
//! the per-path collapse, the tracked-file filter and the expansion of
//! directories that appeared or moved as a whole, which the platform
//! reports as a single event for the directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RenameMode};
use walkdir::WalkDir;

use super::filter::is_tracked;
use super::{FileEvent, FileEventKind};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Created,
    Modified,
    Removed,
    Renamed { from: PathBuf },
}

#[derive(Debug)]
struct Pending {
    state: State,
    seq: u64,
}

#[derive(Default)]
struct Batch {
    pending: HashMap<PathBuf, Pending>,
    seq: u64,
}

/// Collapses a batch into file events, in the order their paths were
/// first seen.
pub fn collapse<'a>(events: impl IntoIterator<Item = &'a notify::Event>) -> Vec<FileEvent> {
    let mut batch = Batch::default();
    for event in events {
        batch.push(event);
    }
    batch.settle_all()
}

impl Batch {
    fn push(&mut self, event: &notify::Event) {
        let paths = &event.paths;
        match &event.kind {
            EventKind::Create(_) => {
                for path in paths {
                    self.appeared(path);
                }
            }
            EventKind::Remove(_) => {
                for path in paths {
                    self.record(path.clone(), State::Removed);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
                self.moved(&paths[0], &paths[1]);
            }
            // Halves the debouncer could not pair.
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in paths {
                    self.record(path.clone(), State::Removed);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in paths {
                    self.appeared(path);
                }
            }
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
                for path in paths {
                    self.record(path.clone(), State::Modified);
                }
            }
            EventKind::Access(_) => {}
        }
    }

    /// A path that showed up. A directory stands for every tracked file
    /// inside it.
    fn appeared(&mut self, path: &Path) {
        if path.is_dir() {
            for file in tracked_files(path) {
                self.record(file, State::Created);
            }
        } else {
            self.record(path.to_path_buf(), State::Created);
        }
    }

    fn moved(&mut self, from: &Path, to: &Path) {
        if to.is_dir() {
            for file in tracked_files(to) {
                let origin = match file.strip_prefix(to) {
                    Ok(rel) => from.join(rel),
                    Err(_) => continue,
                };
                self.rename(origin, file);
            }
        } else {
            self.rename(from.to_path_buf(), to.to_path_buf());
        }
    }

    fn record(&mut self, path: PathBuf, incoming: State) {
        if !is_tracked(&path) {
            return;
        }

        let previous = self.pending.remove(&path);
        let first_seen = previous.as_ref().map(|p| p.seq);
        let next = match (previous.map(|p| p.state), incoming) {
            (None, state) => Some(state),
            (Some(State::Created), State::Removed) => None,
            (Some(State::Created), _) => Some(State::Created),
            (Some(State::Modified), State::Removed) => Some(State::Removed),
            (Some(State::Modified), _) => Some(State::Modified),
            (Some(State::Removed), State::Removed) => Some(State::Removed),
            (Some(State::Removed), _) => Some(State::Modified),
            (Some(State::Renamed { from }), State::Removed) => {
                // Moved and then deleted: only the original name matters.
                self.record(from, State::Removed);
                None
            }
            (Some(renamed @ State::Renamed { .. }), _) => Some(renamed),
        };

        if let Some(state) = next {
            self.insert(path, state, first_seen);
        }
    }

    fn rename(&mut self, from: PathBuf, to: PathBuf) {
        match (is_tracked(&from), is_tracked(&to)) {
            (false, false) => {}
            // e.g. `book.epub.part` -> `book.epub` at the end of a download.
            (false, true) => self.record(to, State::Created),
            (true, false) => self.record(from, State::Removed),
            (true, true) => {
                let state = match self.pending.remove(&from).map(|p| p.state) {
                    Some(State::Created) | Some(State::Removed) => State::Created,
                    Some(State::Renamed { from: origin }) => State::Renamed { from: origin },
                    Some(State::Modified) | None => State::Renamed { from },
                };
                let first_seen = self.pending.get(&to).map(|p| p.seq);
                self.insert(to, state, first_seen);
            }
        }
    }

    fn insert(&mut self, path: PathBuf, state: State, first_seen: Option<u64>) {
        let seq = first_seen.unwrap_or_else(|| {
            self.seq += 1;
            self.seq
        });
        self.pending.insert(path, Pending { state, seq });
    }

    fn settle_all(self) -> Vec<FileEvent> {
        let mut ready: Vec<(PathBuf, Pending)> = self.pending.into_iter().collect();
        ready.sort_by_key(|(_, p)| p.seq);
        ready
            .into_iter()
            .filter_map(|(path, pending)| settle(path, pending.state))
            .collect()
    }
}

/// Turns a collapsed state into an event, re-checking the file system.
fn settle(path: PathBuf, state: State) -> Option<FileEvent> {
    let is_file = path.is_file();
    let exists = is_file || path.exists();
    let kind = match state {
        State::Created if is_file => FileEventKind::Created,
        State::Created => return None,
        State::Modified | State::Removed if is_file => FileEventKind::Modified,
        State::Modified | State::Removed if exists => return None,
        State::Modified | State::Removed => FileEventKind::Removed,
        State::Renamed { from } if is_file => FileEventKind::Renamed { from },
        State::Renamed { from } => return Some(FileEvent::removed(from)),
    };
    Some(FileEvent::new(kind, path))
}

fn tracked_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_tracked(e.path()))
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use notify::Event;
    use tempfile::TempDir;

    fn create(p: &Path) -> Event {
        Event::new(EventKind::Create(CreateKind::File)).add_path(p.to_path_buf())
    }

    fn modify(p: &Path) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(p.to_path_buf())
    }

    fn remove(p: &Path) -> Event {
        Event::new(EventKind::Remove(RemoveKind::File)).add_path(p.to_path_buf())
    }

    fn rename_both(from: &Path, to: &Path) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(from.to_path_buf())
            .add_path(to.to_path_buf())
    }

    fn kinds(events: &[FileEvent]) -> Vec<FileEventKind> {
        events.iter().map(|e| e.kind.clone()).collect()
    }

    #[test]
    fn test_create_modify_burst_collapses_to_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.epub");
        std::fs::write(&path, b"x").unwrap();

        let mut batch = vec![create(&path)];
        batch.extend((0..4).map(|_| modify(&path)));

        let events = collapse(&batch);
        assert_eq!(kinds(&events), vec![FileEventKind::Created]);
        assert_eq!(events[0].path, path);
    }

    #[test]
    fn test_create_then_remove_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.epub");

        assert!(collapse(&[create(&path), remove(&path)]).is_empty());
    }

    #[test]
    fn test_remove_then_create_is_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.epub");
        std::fs::write(&path, b"x").unwrap();

        assert_eq!(
            kinds(&collapse(&[remove(&path), create(&path)])),
            vec![FileEventKind::Modified]
        );
    }

    #[test]
    fn test_modified_then_removed_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.epub");

        assert_eq!(
            kinds(&collapse(&[modify(&path), remove(&path)])),
            vec![FileEventKind::Removed]
        );
    }

    #[test]
    fn test_untracked_files_are_dropped() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, b"x").unwrap();
        let sub = dir.path().join("folder.epub");
        std::fs::create_dir(&sub).unwrap();

        assert!(collapse(&[create(&txt), create(&sub)]).is_empty());
    }

    #[test]
    fn test_rename_pair_reported_as_renamed() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.epub");
        let to = dir.path().join("b.epub");
        std::fs::write(&to, b"x").unwrap();

        let events = collapse(&[rename_both(&from, &to)]);
        assert_eq!(
            kinds(&events),
            vec![FileEventKind::Renamed { from: from.clone() }]
        );
        assert_eq!(events[0].path, to);
    }

    #[test]
    fn test_unpaired_rename_halves_are_removal_and_creation() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("a.epub");
        let arrived = dir.path().join("b.epub");
        std::fs::write(&arrived, b"x").unwrap();

        let events = collapse(&[
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(gone.clone()),
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
                .add_path(arrived.clone()),
        ]);
        assert_eq!(
            kinds(&events),
            vec![FileEventKind::Removed, FileEventKind::Created]
        );
        assert_eq!(events[0].path, gone);
        assert_eq!(events[1].path, arrived);
    }

    #[test]
    fn test_download_finishing_by_rename_is_created() {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("a.epub.part");
        let done = dir.path().join("a.epub");
        std::fs::write(&done, b"x").unwrap();

        let events = collapse(&[create(&part), modify(&part), rename_both(&part, &done)]);
        assert_eq!(kinds(&events), vec![FileEventKind::Created]);
        assert_eq!(events[0].path, done);
    }

    #[test]
    fn test_rename_of_unemitted_create_is_created() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.epub");
        let to = dir.path().join("b.epub");
        std::fs::write(&to, b"x").unwrap();

        let events = collapse(&[create(&from), rename_both(&from, &to)]);
        assert_eq!(kinds(&events), vec![FileEventKind::Created]);
        assert_eq!(events[0].path, to);
    }

    #[test]
    fn test_events_for_different_paths_keep_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.epub");
        let b = dir.path().join("b.epub");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();

        let events = collapse(&[create(&b), create(&a), modify(&b)]);
        assert_eq!(events[0].path, b);
        assert_eq!(events[1].path, a);
    }

    #[test]
    fn test_directory_moved_in_yields_its_books() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("Dune Saga");
        std::fs::create_dir_all(folder.join("extras")).unwrap();
        std::fs::write(folder.join("Dune.epub"), b"d").unwrap();
        std::fs::write(folder.join("extras").join("Messiah.pdf"), b"m").unwrap();
        std::fs::write(folder.join("cover.jpg"), b"c").unwrap();

        let moved_in = Event::new(EventKind::Create(CreateKind::Folder)).add_path(folder.clone());
        let events = collapse(&[moved_in]);

        assert_eq!(
            kinds(&events),
            vec![FileEventKind::Created, FileEventKind::Created]
        );
        let paths: Vec<_> = events.iter().map(|e| e.path.clone()).collect();
        assert!(paths.contains(&folder.join("Dune.epub")));
        assert!(paths.contains(&folder.join("extras").join("Messiah.pdf")));
    }

    #[test]
    fn test_unpaired_directory_arrival_is_expanded() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("incoming");
        std::fs::create_dir(&folder).unwrap();
        std::fs::write(folder.join("Emma.epub"), b"e").unwrap();

        let events = collapse(&[Event::new(EventKind::Modify(ModifyKind::Name(
            RenameMode::To,
        )))
        .add_path(folder.clone())]);
        assert_eq!(kinds(&events), vec![FileEventKind::Created]);
        assert_eq!(events[0].path, folder.join("Emma.epub"));
    }

    #[test]
    fn test_directory_rename_renames_each_book() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("Austen");
        let new = dir.path().join("Jane Austen");
        std::fs::create_dir(&new).unwrap();
        std::fs::write(new.join("Emma.epub"), b"e").unwrap();
        std::fs::write(new.join("Persuasion.epub"), b"p").unwrap();

        let events = collapse(&[rename_both(&old, &new)]);
        assert_eq!(
            kinds(&events),
            vec![
                FileEventKind::Renamed {
                    from: old.join("Emma.epub")
                },
                FileEventKind::Renamed {
                    from: old.join("Persuasion.epub")
                },
            ]
        );
        assert_eq!(events[0].path, new.join("Emma.epub"));
    }
}
