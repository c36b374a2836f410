use crate::candle_numeric_util::to_float;
use crate::error::{Result, VaeError};

use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use log::info;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const IDX_IMAGE_MAGIC: u32 = 0x0000_0803;
const IDX_LABEL_MAGIC: u32 = 0x0000_0801;

pub struct MinibatchData {
    /// images (n x c x h x w) in [0, 1]
    pub input: Tensor,
    /// class labels (n), u32
    pub labels: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_samples(&self) -> usize;
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` or `ordered_minibatch` is called,
/// `chunks` partition the samples. The last chunk may be short.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) {
        self.samples.shuffle(rng);
        self.chunk(batch_size);
    }

    pub fn ordered_minibatch(&mut self, batch_size: usize) {
        self.samples.sort_unstable();
        self.chunk(batch_size);
    }

    fn chunk(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Images kept on the host with their labels
#[derive(Clone)]
pub struct ImageDataset {
    images: Tensor,
    labels: Vec<u32>,
}

impl ImageDataset {
    ///
    /// * `images` - (n x c x h x w) in [0, 1]
    /// * `labels` - n class labels
    ///
    pub fn new(images: Tensor, labels: Vec<u32>) -> Result<Self> {
        let dims = images.dims();
        if dims.len() != 4 || dims[0] != labels.len() {
            return Err(VaeError::shape(
                "image dataset",
                &[labels.len(), 0, 0, 0],
                dims,
            ));
        }
        Ok(Self {
            images: to_float(&images)?,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// per-example shape `[c, h, w]`
    pub fn img_shp(&self) -> Vec<usize> {
        self.images.dims()[1..].to_vec()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// rows `indices` moved to `target_device`
    pub fn take(&self, indices: &[usize], target_device: &Device) -> Result<MinibatchData> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let labels: Vec<u32> = indices.iter().map(|&i| self.labels[i]).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.images.device())?;
        Ok(MinibatchData {
            input: self.images.index_select(&idx, 0)?.to_device(target_device)?,
            labels: Tensor::from_vec(labels, indices.len(), target_device)?,
        })
    }
}

/// Restricts a dataset to the examples of one class
#[derive(Clone, Copy, Debug)]
pub struct ClassSampler {
    pub class_number: u32,
}

impl ClassSampler {
    pub fn new(class_number: u32) -> Self {
        Self { class_number }
    }

    pub fn apply(&self, data: &ImageDataset) -> Result<ImageDataset> {
        let keep: Vec<usize> = (0..data.len())
            .filter(|&i| data.labels[i] == self.class_number)
            .collect();
        let sub = data.take(&keep, data.images.device())?;
        ImageDataset::new(sub.input, keep.iter().map(|&i| data.labels[i]).collect())
    }
}

/// one split of an `ImageLoader` with its minibatch partition
pub struct ImageSplit {
    data: ImageDataset,
    minibatches: Minibatches,
}

impl ImageSplit {
    fn new(data: ImageDataset, batch_size: usize) -> Self {
        let mut minibatches = Minibatches::new(data.len());
        minibatches.ordered_minibatch(batch_size);
        Self { data, minibatches }
    }
}

impl DataLoader for ImageSplit {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> Result<MinibatchData> {
        let chunk = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            VaeError::config(format!(
                "minibatch {} out of {}",
                batch_idx,
                self.minibatches.chunks.len()
            ))
        })?;
        self.data.take(chunk, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }
}

/// Train and test splits of one (class-conditional) image task
pub struct ImageLoader {
    pub name: String,
    pub train: ImageSplit,
    pub test: ImageSplit,
    pub batch_size: usize,
    pub img_shp: Vec<usize>,
}

impl ImageLoader {
    pub fn new(name: &str, train: ImageDataset, test: ImageDataset, batch_size: usize) -> Result<Self> {
        if train.img_shp() != test.img_shp() {
            return Err(VaeError::shape("test images", &train.img_shp(), &test.img_shp()));
        }
        if train.is_empty() {
            return Err(VaeError::config(format!("{}: empty training set", name)));
        }
        let img_shp = train.img_shp();
        Ok(Self {
            name: name.to_string(),
            train: ImageSplit::new(train, batch_size),
            test: ImageSplit::new(test, batch_size),
            batch_size,
            img_shp,
        })
    }

    /// reshuffle the training minibatches; the test split stays ordered
    pub fn shuffle_train(&mut self, rng: &mut StdRng) {
        self.train.minibatches.shuffle_minibatch(self.batch_size, rng);
    }
}

////////////////
// IDX format //
////////////////

/// Open a file for reading, gunzipping if it ends with `.gz`
pub fn open_buf_reader<P: AsRef<Path>>(input_file: P) -> Result<Box<dyn BufRead>> {
    let input_file = input_file.as_ref();
    let ext = input_file.extension().and_then(|x| x.to_str());
    let file = File::open(input_file)?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

fn invalid_data(msg: String) -> VaeError {
    VaeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn read_be_u32(reader: &mut dyn BufRead) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_magic(reader: &mut dyn BufRead, expected: u32, path: &Path) -> Result<()> {
    let magic = read_be_u32(reader)?;
    if magic != expected {
        return Err(invalid_data(format!(
            "{}: magic {:#010x}, expected {:#010x}",
            path.display(),
            magic,
            expected
        )));
    }
    Ok(())
}

/// Read IDX images (magic 0x803) as (n x 1 x rows x cols) in [0, 1]
pub fn read_idx_images<P: AsRef<Path>>(path: P) -> Result<Tensor> {
    let path = path.as_ref();
    let mut reader = open_buf_reader(path)?;
    read_magic(reader.as_mut(), IDX_IMAGE_MAGIC, path)?;

    let n = read_be_u32(reader.as_mut())? as usize;
    let rows = read_be_u32(reader.as_mut())? as usize;
    let cols = read_be_u32(reader.as_mut())? as usize;

    let mut bytes = vec![0u8; n * rows * cols];
    reader.read_exact(&mut bytes)?;

    let pixels: Vec<f32> = bytes.par_iter().map(|&b| b as f32 / 255.).collect();
    info!("read {} images of {}x{} from {}", n, rows, cols, path.display());
    Ok(Tensor::from_vec(pixels, (n, 1, rows, cols), &Device::Cpu)?)
}

/// Read IDX labels (magic 0x801)
pub fn read_idx_labels<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let mut reader = open_buf_reader(path)?;
    read_magic(reader.as_mut(), IDX_LABEL_MAGIC, path)?;

    let n = read_be_u32(reader.as_mut())? as usize;
    let mut bytes = vec![0u8; n];
    reader.read_exact(&mut bytes)?;
    Ok(bytes.into_iter().map(u32::from).collect())
}

/// `{stem}` or `{stem}.gz` under `dir`, whichever exists
fn find_idx_file(dir: &Path, stem: &str) -> Result<PathBuf> {
    let plain = dir.join(stem);
    if plain.exists() {
        return Ok(plain);
    }
    let gz = dir.join(format!("{}.gz", stem));
    if gz.exists() {
        return Ok(gz);
    }
    Err(VaeError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} not found in {}", stem, dir.display()),
    )))
}

fn read_idx_split(dir: &Path, prefix: &str) -> Result<ImageDataset> {
    let images = read_idx_images(find_idx_file(dir, &format!("{}-images-idx3-ubyte", prefix))?)?;
    let labels = read_idx_labels(find_idx_file(dir, &format!("{}-labels-idx1-ubyte", prefix))?)?;
    ImageDataset::new(images, labels)
}

/// tasks stored as IDX files: `mnist`, `fashion`
pub fn is_idx_task(task: &str) -> bool {
    matches!(task, "mnist" | "fashion")
}

///
/// One class-conditional loader per class in `classes`, built from
/// the IDX files of `task` under `data_dir`
///
/// * `task` - `mnist` or `fashion`
/// * `data_dir` - directory with `{train,t10k}-{images-idx3,labels-idx1}-ubyte[.gz]`
/// * `batch_size` - minibatch size
/// * `classes` - class numbers, one loader each
///
pub fn mnist_loaders<P: AsRef<Path>>(
    task: &str,
    data_dir: P,
    batch_size: usize,
    classes: &[u32],
) -> Result<Vec<ImageLoader>> {
    if !is_idx_task(task) {
        return Err(VaeError::config(format!("unsupported task: {}", task)));
    }

    let dir = data_dir.as_ref();
    let train = read_idx_split(dir, "train")?;
    let test = read_idx_split(dir, "t10k")?;

    classes
        .iter()
        .map(|&c| {
            let sampler = ClassSampler::new(c);
            let name = format!("{}_class{}", task, c);
            let loader = ImageLoader::new(&name, sampler.apply(&train)?, sampler.apply(&test)?, batch_size)?;
            info!(
                "{}: {} train, {} test examples",
                name,
                loader.train.num_samples(),
                loader.test.num_samples()
            );
            Ok(loader)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rand::SeedableRng;
    use std::io::Write;

    fn idx_images(n: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IDX_IMAGE_MAGIC.to_be_bytes());
        for v in [n, rows, cols] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend((0..n * rows * cols).map(|i| (i % 256) as u8));
        out
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IDX_LABEL_MAGIC.to_be_bytes());
        out.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        out.extend_from_slice(labels);
        out
    }

    fn write_file(path: &Path, bytes: &[u8], gz: bool) -> Result<()> {
        let mut file = File::create(path)?;
        if gz {
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(bytes)?;
            enc.finish()?;
        } else {
            file.write_all(bytes)?;
        }
        Ok(())
    }

    #[test]
    fn idx_plain_and_gz() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for gz in [false, true] {
            let name = if gz { "x.idx.gz" } else { "x.idx" };
            let path = dir.path().join(name);
            write_file(&path, &idx_images(3, 2, 4), gz)?;

            let images = read_idx_images(&path)?;
            assert_eq!(images.dims(), &[3, 1, 2, 4]);
            let flat = images.flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(flat[0], 0.);
            assert_eq!(flat[5], 5. / 255.);
        }
        Ok(())
    }

    #[test]
    fn idx_rejects_wrong_magic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("labels.idx");
        write_file(&path, &idx_labels(&[1, 2, 3]), false)?;
        assert_eq!(read_idx_labels(&path)?, vec![1, 2, 3]);
        assert!(matches!(read_idx_images(&path), Err(VaeError::Io(_))));
        Ok(())
    }

    #[test]
    fn sampler_keeps_one_class() -> Result<()> {
        let images = Tensor::rand(0f32, 1., (6, 1, 2, 2), &Device::Cpu)?;
        let data = ImageDataset::new(images, vec![0, 1, 2, 1, 0, 1])?;
        let ones = ClassSampler::new(1).apply(&data)?;
        assert_eq!(ones.len(), 3);
        assert!(ones.labels().iter().all(|&l| l == 1));
        assert_eq!(ones.img_shp(), vec![1, 2, 2]);
        Ok(())
    }

    #[test]
    fn minibatches_partition_samples() -> Result<()> {
        let images = Tensor::rand(0f32, 1., (10, 1, 2, 2), &Device::Cpu)?;
        let data = ImageDataset::new(images, vec![3; 10])?;
        let mut loader = ImageLoader::new("toy", data.clone(), data, 4)?;

        let mut rng = StdRng::seed_from_u64(5);
        loader.shuffle_train(&mut rng);
        assert_eq!(loader.train.num_minibatch(), 3);

        let mut seen: Vec<usize> = loader.train.minibatches.chunks.concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        let last = loader.test.minibatch_data(2, &Device::Cpu)?;
        assert_eq!(last.input.dims(), &[2, 1, 2, 2]);
        assert_eq!(last.labels.to_vec1::<u32>()?, vec![3, 3]);
        assert!(loader.test.minibatch_data(3, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn unknown_task_is_rejected() {
        assert!(matches!(
            mnist_loaders("cifar10", "/nonexistent", 8, &[0]),
            Err(VaeError::Configuration(_))
        ));
    }
}
