//! Per-domain IPC state
//!
//! [`DomainIo`] bundles what every domain other than init needs to talk to
//! the rest of the system: its kernel view, its CSpace, its channels and its
//! dispatcher (endpoints are retyped from it).

use core::time::Duration;

use log::info;
use tern_cap::{CSpace, Capability};
use tern_platform::{slots, Kernel, ObjType, DEFAULT_ENDPOINT_BUF_WORDS};

use crate::channel::{Channel, ChannelId, ChannelSet};
use crate::event::{EventSource, Io};
use crate::rpc::RpcClient;
use crate::Result;

pub struct DomainIo<K> {
    pub kernel: K,
    pub cspace: CSpace,
    pub channels: ChannelSet,
    pub dispatcher: Capability,
    pub buf_words: usize,
}

impl<K: Kernel> DomainIo<K> {
    /// Set up IPC for the calling domain from its well-known slots
    pub fn new(kernel: K) -> Result<Self> {
        let cspace = CSpace::for_domain(&kernel)?;
        let dispatcher = cspace.well_known(slots::DISPATCHER, ObjType::Dispatcher);
        Ok(Self {
            kernel,
            cspace,
            channels: ChannelSet::new(),
            dispatcher,
            buf_words: DEFAULT_ENDPOINT_BUF_WORDS,
        })
    }

    pub fn with_buffer(mut self, buf_words: usize) -> Self {
        self.buf_words = buf_words;
        self
    }

    /// Connect to init through the endpoint it left in `INIT_EP`
    pub fn connect_init(&mut self, timeout: Option<Duration>) -> Result<ChannelId> {
        let init_ep = self.cspace.well_known(slots::INIT_EP, ObjType::Endpoint);
        let id = self.connect(init_ep, timeout)?;
        info!("connected to init on channel {}", id);
        Ok(id)
    }

    /// Open a channel to `remote` and run the handshake
    pub fn connect(&mut self, remote: Capability, timeout: Option<Duration>) -> Result<ChannelId> {
        let mut chan = Channel::connect_to(
            &self.kernel,
            &mut self.cspace,
            &self.dispatcher,
            self.buf_words,
            remote,
        )?;
        if let Err(e) = chan.initiate(&self.kernel, &mut self.cspace, timeout) {
            chan.destroy(&self.kernel, &mut self.cspace)?;
            return Err(e);
        }
        Ok(self.channels.insert(chan))
    }

    /// Open a channel whose remote will be learnt from the peer
    pub fn accept_channel(&mut self) -> Result<ChannelId> {
        let chan = Channel::accept(&self.kernel, &mut self.cspace, &self.dispatcher, self.buf_words)?;
        Ok(self.channels.insert(chan))
    }

    pub fn close(&mut self, id: ChannelId) -> Result<()> {
        let chan = self.channels.remove(id)?;
        chan.destroy(&self.kernel, &mut self.cspace)
    }

    /// RPC client over channel `id`
    pub fn rpc(&mut self, id: ChannelId, timeout: Option<Duration>) -> Result<RpcClient<'_, K>> {
        let chan = self.channels.get_mut(id)?;
        Ok(RpcClient::new(&self.kernel, &mut self.cspace, chan, timeout))
    }
}

impl<K: Kernel> EventSource for DomainIo<K> {
    type Kernel = K;

    fn io(&mut self) -> Io<'_, K> {
        Io { kernel: &self.kernel, cspace: &mut self.cspace, channels: &mut self.channels }
    }
}
