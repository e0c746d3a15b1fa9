use super::SplitError;
use crate::{
    arrays::{dimension_len, ArrayBackends, ArrayTool, ChunkLayout},
    batch::{BatchPaths, SplitAxis},
    scratch::ScratchFile,
};
use itertools::Itertools;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Input files every batch needs
pub const INPUT_FILES: [&str; 12] = [
    "co2.nc",
    "projected-co2.nc",
    "drainage.nc",
    "fri-fire.nc",
    "run-mask.nc",
    "soil-texture.nc",
    "topo.nc",
    "vegetation.nc",
    "historic-explicit-fire.nc",
    "projected-explicit-fire.nc",
    "projected-climate.nc",
    "historic-climate.nc",
];

/// Inputs without a spatial grid, copied verbatim
pub const INPUT_FILES_TO_COPY: [&str; 2] = ["co2.nc", "projected-co2.nc"];

pub const RUN_MASK_FILE: &str = "run-mask.nc";

/// Pre chunked piece of the input, named `<start>_<end>` along Y
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub dir: PathBuf,
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    pub fn parse(dir: PathBuf) -> Option<Self> {
        let name = dir.file_name()?.to_str()?;
        let mut parts = name.rsplitn(3, '_');
        let end = parts.next()?.parse().ok()?;
        let start = parts.next()?.parse().ok()?;

        (start < end).then_some(Self { dir, start, end })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputLayout {
    Flat(PathBuf),
    Chunked(Vec<Chunk>),
}

impl InputLayout {
    /// An input directory holds either files or chunk directories, never both
    pub fn discover(input: &Path) -> Result<Self, SplitError> {
        if !input.is_dir() {
            return Err(SplitError::InputMissing(input.to_path_buf()));
        }

        let entries = fs::read_dir(input)
            .and_then(|entries| entries.map(|entry| entry.map(|entry| entry.path())).collect::<Result<Vec<_>, _>>())
            .map_err(|source| SplitError::Io {
                path: input.to_path_buf(),
                source,
            })?;
        let (dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|path| path.is_dir());

        match (dirs.is_empty(), files.is_empty()) {
            (true, _) => Ok(Self::Flat(input.to_path_buf())),
            (false, true) => {
                let chunks = dirs
                    .into_iter()
                    .map(|dir| Chunk::parse(dir.clone()).ok_or(SplitError::ChunkName(dir)))
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(Self::Chunked(
                    chunks.into_iter().sorted_by_key(|chunk| chunk.start).collect(),
                ))
            }
            (false, false) => Err(SplitError::MixedInput(input.to_path_buf())),
        }
    }
}

/// Size of the spatial domain and the Y extent of every chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Domain {
    pub x_len: usize,
    pub y_len: usize,
    pub chunk_extents: Vec<usize>,
}

impl Domain {
    pub fn cells(&self) -> usize {
        self.x_len * self.y_len
    }

    pub fn axis_len(&self, axis: SplitAxis) -> usize {
        match axis {
            SplitAxis::X => self.x_len,
            SplitAxis::Y => self.y_len,
        }
    }

    pub fn discover(tool: &dyn ArrayTool, layout: &InputLayout) -> Result<Self, SplitError> {
        match layout {
            InputLayout::Flat(dir) => {
                let mask = dir.join(RUN_MASK_FILE);

                Ok(Self {
                    x_len: dimension_len(tool, &mask, "X")?,
                    y_len: dimension_len(tool, &mask, "Y")?,
                    chunk_extents: Vec::new(),
                })
            }
            InputLayout::Chunked(chunks) => {
                let mut x_len = None;
                let mut y_len = 0;
                let mut chunk_extents = Vec::with_capacity(chunks.len());

                for chunk in chunks {
                    let mask = chunk.dir.join(RUN_MASK_FILE);
                    let chunk_x = dimension_len(tool, &mask, "X")?;
                    let chunk_y = dimension_len(tool, &mask, "Y")?;

                    match x_len {
                        Some(x_len) if x_len != chunk_x => {
                            return Err(SplitError::DomainMismatch(format!(
                                "chunk {} has X={chunk_x}, expected X={x_len}",
                                chunk.dir.display()
                            )))
                        }
                        _ => x_len = Some(chunk_x),
                    }

                    // batches are indexed by the chunk names, so they have to tile Y
                    if chunk.start != y_len || chunk.end != y_len + chunk_y {
                        return Err(SplitError::DomainMismatch(format!(
                            "chunk {} covers Y={}..{}, expected Y={y_len}..{}",
                            chunk.dir.display(),
                            chunk.start,
                            chunk.end,
                            y_len + chunk_y
                        )));
                    }

                    y_len += chunk_y;
                    chunk_extents.push(chunk_y);
                }

                Ok(Self {
                    x_len: x_len.unwrap_or(0),
                    y_len,
                    chunk_extents,
                })
            }
        }
    }
}

/// One unit of work on the slicing pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SliceTask {
    Copy {
        src: PathBuf,
        dst: PathBuf,
    },
    Subset {
        src: PathBuf,
        dim: &'static str,
        index: usize,
        dst: PathBuf,
    },
    /// slice every chunk at `index` and join the pieces along Y
    Stitch {
        srcs: Vec<PathBuf>,
        dim: &'static str,
        index: usize,
        dst: PathBuf,
    },
}

impl SliceTask {
    pub fn destination(&self) -> &Path {
        match self {
            Self::Copy { dst, .. } | Self::Subset { dst, .. } | Self::Stitch { dst, .. } => dst,
        }
    }

    pub fn run(&self, tool: &ArrayBackends) -> Result<(), SplitError> {
        match self {
            Self::Copy { src, dst } => {
                fs::copy(src, dst).map_err(|source| SplitError::Io {
                    path: src.clone(),
                    source,
                })?;
            }
            Self::Subset {
                src,
                dim,
                index,
                dst,
            } => tool.subset(src, dim, *index, dst)?,
            Self::Stitch {
                srcs,
                dim,
                index,
                dst,
            } => {
                let scratch = dst.parent().unwrap_or_else(|| Path::new("."));
                let pieces = srcs
                    .iter()
                    .map(|src| {
                        let piece = ScratchFile::new(scratch, ".nc");
                        tool.subset(src, dim, *index, piece.path())?;
                        Ok(piece)
                    })
                    .collect::<Result<Vec<_>, SplitError>>()?;
                let paths = pieces.iter().map(|piece| piece.to_path_buf()).collect_vec();

                tool.concatenate(&paths, "Y", dst, &ChunkLayout::none())?;
                debug!(dst = ?dst, pieces = paths.len(), "Stitched chunk pieces");
            }
        }

        Ok(())
    }
}

fn is_copied(file: &str) -> bool {
    INPUT_FILES_TO_COPY.contains(&file)
}

/// Plan the slicing tasks for all batches along `axis`
pub fn plan(
    layout: &InputLayout,
    domain: &Domain,
    axis: SplitAxis,
    batch_root: &Path,
) -> Vec<SliceTask> {
    let batch_input = |index: usize, file: &str| BatchPaths::new(batch_root, index).input_dir().join(file);
    let batches = domain.axis_len(axis);
    let mut tasks = Vec::new();

    match layout {
        InputLayout::Flat(dir) => {
            for file in INPUT_FILES {
                for index in 0..batches {
                    let src = dir.join(file);
                    let dst = batch_input(index, file);

                    tasks.push(if is_copied(file) {
                        SliceTask::Copy { src, dst }
                    } else {
                        SliceTask::Subset {
                            src,
                            dim: axis.upper(),
                            index,
                            dst,
                        }
                    });
                }
            }
        }
        InputLayout::Chunked(chunks) if axis == SplitAxis::Y => {
            for file in INPUT_FILES {
                for (chunk, extent) in chunks.iter().zip(&domain.chunk_extents) {
                    for local in 0..*extent {
                        let src = chunk.dir.join(file);
                        let dst = batch_input(chunk.start + local, file);

                        tasks.push(if is_copied(file) {
                            SliceTask::Copy { src, dst }
                        } else {
                            SliceTask::Subset {
                                src,
                                dim: "Y",
                                index: local,
                                dst,
                            }
                        });
                    }
                }
            }
        }
        InputLayout::Chunked(chunks) => {
            for file in INPUT_FILES {
                for index in 0..batches {
                    let dst = batch_input(index, file);

                    tasks.push(match (is_copied(file), chunks.first()) {
                        (true, Some(first)) => SliceTask::Copy {
                            src: first.dir.join(file),
                            dst,
                        },
                        _ => SliceTask::Stitch {
                            srcs: chunks.iter().map(|chunk| chunk.dir.join(file)).collect(),
                            dim: "X",
                            index,
                            dst,
                        },
                    });
                }
            }
        }
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::{dataset::tests::grid, NativeTool};
    use ndarray::Array2;

    #[test]
    fn chunk_names_carry_the_offsets() {
        assert_eq!(
            Chunk::parse(PathBuf::from("/in/0_100")),
            Some(Chunk {
                dir: PathBuf::from("/in/0_100"),
                start: 0,
                end: 100
            })
        );
        assert_eq!(
            Chunk::parse(PathBuf::from("/in/chunk_100_200")).map(|chunk| chunk.start),
            Some(100)
        );
        assert_eq!(Chunk::parse(PathBuf::from("/in/input")), None);
    }

    #[test]
    fn mixed_input_directories_are_rejected() {
        let directory = tempfile::tempdir().unwrap();
        fs::create_dir(directory.path().join("0_10")).unwrap();
        fs::write(directory.path().join("run-mask.nc"), "").unwrap();

        assert!(matches!(
            InputLayout::discover(directory.path()),
            Err(SplitError::MixedInput(_))
        ));
    }

    fn chunk_mask(input: &Path, name: &str, y_len: usize) {
        NativeTool
            .write(
                &grid("run", Array2::ones((y_len, 3)), -9999.0),
                &input.join(name).join(RUN_MASK_FILE),
            )
            .unwrap();
    }

    #[test]
    fn chunks_have_to_tile_the_domain() {
        let directory = tempfile::tempdir().unwrap();
        chunk_mask(directory.path(), "0_2", 2);
        chunk_mask(directory.path(), "2_5", 3);

        let layout = InputLayout::discover(directory.path()).unwrap();
        let domain = Domain::discover(&NativeTool, &layout).unwrap();
        assert_eq!((domain.y_len, domain.x_len), (5, 3));
        assert_eq!(domain.chunk_extents, vec![2, 3]);
    }

    #[test]
    fn misnamed_chunks_are_rejected() {
        let directory = tempfile::tempdir().unwrap();
        chunk_mask(directory.path(), "0_2", 2);
        chunk_mask(directory.path(), "4_6", 2);

        let layout = InputLayout::discover(directory.path()).unwrap();
        assert!(matches!(
            Domain::discover(&NativeTool, &layout),
            Err(SplitError::DomainMismatch(_))
        ));
    }

    #[test]
    fn flat_plan_slices_every_grid_file_once_per_batch() {
        let domain = Domain {
            x_len: 2,
            y_len: 3,
            chunk_extents: Vec::new(),
        };
        let tasks = plan(
            &InputLayout::Flat(PathBuf::from("/in")),
            &domain,
            SplitAxis::Y,
            Path::new("/out"),
        );

        assert_eq!(tasks.len(), INPUT_FILES.len() * 3);
        assert!(tasks.contains(&SliceTask::Subset {
            src: PathBuf::from("/in/topo.nc"),
            dim: "Y",
            index: 2,
            dst: PathBuf::from("/out/batch_2/input/topo.nc"),
        }));
        assert!(tasks.contains(&SliceTask::Copy {
            src: PathBuf::from("/in/co2.nc"),
            dst: PathBuf::from("/out/batch_1/input/co2.nc"),
        }));
    }

    #[test]
    fn chunked_plan_maps_local_indices_to_batches() {
        let chunks = vec![
            Chunk {
                dir: PathBuf::from("/in/0_2"),
                start: 0,
                end: 2,
            },
            Chunk {
                dir: PathBuf::from("/in/2_5"),
                start: 2,
                end: 5,
            },
        ];
        let domain = Domain {
            x_len: 2,
            y_len: 5,
            chunk_extents: vec![2, 3],
        };

        let along_y = plan(
            &InputLayout::Chunked(chunks.clone()),
            &domain,
            SplitAxis::Y,
            Path::new("/out"),
        );
        assert!(along_y.contains(&SliceTask::Subset {
            src: PathBuf::from("/in/2_5/vegetation.nc"),
            dim: "Y",
            index: 1,
            dst: PathBuf::from("/out/batch_3/input/vegetation.nc"),
        }));

        let along_x = plan(
            &InputLayout::Chunked(chunks),
            &domain,
            SplitAxis::X,
            Path::new("/out"),
        );
        assert_eq!(along_x.len(), INPUT_FILES.len() * 2);
        assert!(along_x.contains(&SliceTask::Stitch {
            srcs: vec![
                PathBuf::from("/in/0_2/vegetation.nc"),
                PathBuf::from("/in/2_5/vegetation.nc")
            ],
            dim: "X",
            index: 1,
            dst: PathBuf::from("/out/batch_1/input/vegetation.nc"),
        }));
    }
}
