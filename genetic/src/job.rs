//! Messages exchanged between the god process and its workers.

use crate::population::{Chromosome, CHROMOSOME_SLOTS};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use evofuzz_trace::Verdict;

/// Why a job was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// The organism belongs to the first generation.
    Genesis,
    /// The organism was bred from a previous generation.
    NewGeneration,
}

impl Write for JobKind {
    fn write(&self, buf: &mut impl BufMut) {
        let tag: u8 = match self {
            JobKind::Genesis => 0,
            JobKind::NewGeneration => 1,
        };
        tag.write(buf);
    }
}

impl Read for JobKind {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(JobKind::Genesis),
            1 => Ok(JobKind::NewGeneration),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

impl EncodeSize for JobKind {
    fn encode_size(&self) -> usize {
        1
    }
}

/// A request to run one organism against its syscall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub syscall: u64,
    pub species: u32,
    pub organism: u32,
    pub generation: u64,
    pub args: Chromosome,
}

impl Job {
    /// Number of argument values carried.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

impl Write for Job {
    fn write(&self, buf: &mut impl BufMut) {
        self.kind.write(buf);
        self.syscall.write(buf);
        self.species.write(buf);
        self.organism.write(buf);
        self.generation.write(buf);
        (self.args.len() as u8).write(buf);
        for gene in self.args.genes() {
            gene.write(buf);
        }
    }
}

impl Read for Job {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let kind = JobKind::read(buf)?;
        let syscall = u64::read(buf)?;
        let species = u32::read(buf)?;
        let organism = u32::read(buf)?;
        let generation = u64::read(buf)?;
        let count = u8::read(buf)? as usize;
        if count > CHROMOSOME_SLOTS {
            return Err(CodecError::Invalid("genetic::Job", "too many arguments"));
        }
        let mut args = Chromosome::zeroed(count);
        for gene in args.genes_mut() {
            *gene = u64::read(buf)?;
        }
        Ok(Self {
            kind,
            syscall,
            species,
            organism,
            generation,
            args,
        })
    }
}

impl EncodeSize for Job {
    fn encode_size(&self) -> usize {
        self.kind.encode_size() + 8 + 4 + 4 + 8 + 1 + 8 * self.args.len()
    }
}

/// A worker's answer to a [Job].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub species: u32,
    pub organism: u32,
    pub generation: u64,
    /// How the target behaved, or `None` if the engine aborted the job.
    pub verdict: Option<Verdict>,
}

impl Report {
    /// Answer `job` with `verdict`.
    pub fn answer(job: &Job, verdict: Option<Verdict>) -> Self {
        Self {
            species: job.species,
            organism: job.organism,
            generation: job.generation,
            verdict,
        }
    }

    /// Whether this report answers `job`.
    pub fn answers(&self, job: &Job) -> bool {
        self.species == job.species
            && self.organism == job.organism
            && self.generation == job.generation
    }
}

impl Write for Report {
    fn write(&self, buf: &mut impl BufMut) {
        self.species.write(buf);
        self.organism.write(buf);
        self.generation.write(buf);
        self.verdict.write(buf);
    }
}

impl Read for Report {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            species: u32::read(buf)?,
            organism: u32::read(buf)?,
            generation: u64::read(buf)?,
            verdict: Option::<Verdict>::read(buf)?,
        })
    }
}

impl EncodeSize for Report {
    fn encode_size(&self) -> usize {
        4 + 4 + 8 + self.verdict.encode_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use commonware_macros::test_traced;
    use evofuzz_ipc::{pipe::Pipe, port::Port, Channel, Transport};
    use nix::sys::wait::{waitpid, WaitStatus};

    fn job() -> Job {
        Job {
            kind: JobKind::NewGeneration,
            syscall: 257,
            species: 3,
            organism: 999,
            generation: 12,
            args: Chromosome::from_genes(&[u64::MAX, 0, 4096]).unwrap(),
        }
    }

    /// Send a job to a forked echo worker and check what comes back.
    fn echo<T: Transport>(transport: T) {
        let (pid, channel) = transport
            .spawn(|channel| {
                let Ok(job) = channel.recv::<Job>() else {
                    return 1;
                };
                match channel.send(&job) {
                    Ok(()) => 0,
                    Err(_) => 2,
                }
            })
            .unwrap();

        let sent = job();
        channel.send(&sent).unwrap();
        let received: Job = channel.recv().unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.arg_count(), 3);
        assert_eq!(received.encode(), sent.encode());
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[test_traced]
    fn test_job_over_pipe() {
        echo(Pipe);
    }

    #[test_traced]
    fn test_job_over_port() {
        echo(Port);
    }

    #[test]
    fn test_job_rejects_wide_chromosome() {
        let mut encoded = job().encode().to_vec();

        // The argument count sits right after the fixed-size header
        encoded[25] = CHROMOSOME_SLOTS as u8 + 1;
        assert!(Job::decode(&encoded[..]).is_err());

        encoded[0] = 7;
        assert!(matches!(
            Job::decode(&encoded[..]),
            Err(CodecError::InvalidEnum(7))
        ));
    }

    #[test]
    fn test_report() {
        let job = job();
        let report = Report::answer(&job, Some(Verdict::Crashed { signal: 6 }));
        assert!(report.answers(&job));
        assert_eq!(Report::decode(report.encode()).unwrap(), report);

        let aborted = Report::answer(&job, None);
        assert_eq!(aborted.encode().len(), aborted.encode_size());
        assert_eq!(Report::decode(aborted.encode()).unwrap(), aborted);

        let stale = Report {
            generation: 11,
            ..report
        };
        assert!(!stale.answers(&job));
    }
}
